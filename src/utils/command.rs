use std::io;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::debug;

/// 外部命令的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// 被信号终止时为 -1
    pub exit_code: i32,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 运行一次性外部命令 (openssl / tar / ss / 内核子命令)
///
/// 参数总是显式的 argv，不经过 shell 拼接。测试中替换为假实现。
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<CommandOutput>>;
}

/// 由字符串切片构造 argv
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// 基于 tokio::process 的真实实现
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CommandRunner for SystemRunner {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<CommandOutput>> {
        Box::pin(async move {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let output = tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} 超时 ({:?})", program, self.timeout),
                    )
                })??;

            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!("{} stderr: {}", program, stderr.trim());
            }

            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        })
    }
}
