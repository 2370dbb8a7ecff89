//! sing-box 进程监管

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::utils::{argv, BootstrapError, CommandRunner, Result};

/// 刚写入的可执行文件偶尔会遇到 ETXTBSY
const SPAWN_ATTEMPTS: usize = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 进程退出时附带的日志行数
const LOG_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 在宽限期内响应 SIGTERM 退出
    Exited,
    ForceKilled,
    NotRunning,
}

pub struct SupervisedProcess {
    child: Child,
    pub pid: u32,
    pub started_at: Instant,
    pub log_path: PathBuf,
}

impl SupervisedProcess {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

pub struct ProcessSupervisor {
    settings: SupervisorConfig,
    runner: Arc<dyn CommandRunner>,
    log_path: PathBuf,
    state: SupervisorState,
    process: Option<SupervisedProcess>,
}

/// 从 ss / netstat 输出中提取本地监听端口
pub fn listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .flat_map(|line| line.split_whitespace())
        .filter_map(|token| token.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse::<u16>().ok())
        .collect()
}

/// 日志文件的最后几行，用于错误信息
fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join(" | ")
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid 超出范围"))?;
    // SAFETY: kill 只向该 pid 发送信号，不涉及内存
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "SIGTERM 仅支持 unix"))
}

#[cfg(unix)]
fn is_text_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_e: &io::Error) -> bool {
    false
}

impl ProcessSupervisor {
    pub fn new(
        settings: SupervisorConfig,
        runner: Arc<dyn CommandRunner>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            runner,
            log_path: log_path.into(),
            state: SupervisorState::Idle,
            process: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    async fn spawn(&self, binary: &Path, config: &Path) -> Result<Child> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            let log_err = log.try_clone()?;

            let spawned = Command::new(binary)
                .arg("run")
                .arg("-c")
                .arg(config)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err))
                .kill_on_drop(true)
                .spawn();

            match spawned {
                Ok(child) => return Ok(child),
                Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                    debug!("{} 正忙，稍后重试启动", binary.display());
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(BootstrapError::Supervision(format!(
                        "无法启动 {}: {}",
                        binary.display(),
                        e
                    )))
                }
            }
        }
    }

    /// 启动 `<binary> run -c <config>` 并确认端口监听
    ///
    /// 进程在确认期间退出返回 ProcessExited；进程存活但端口未在期限内出现时
    /// 返回 PortsNotListening，此时进程继续运行，状态为 Running。
    pub async fn start(&mut self, binary: &Path, config: &Path, ports: &[u16]) -> Result<u32> {
        if self.state != SupervisorState::Idle {
            return Err(BootstrapError::Supervision(format!(
                "当前状态 {:?}，无法再次启动",
                self.state
            )));
        }

        let child = self.spawn(binary, config).await?;
        let pid = child.id().unwrap_or_default();
        info!("🚀 sing-box 已启动 (PID {})", pid);

        self.state = SupervisorState::Starting;
        self.process = Some(SupervisedProcess {
            child,
            pid,
            started_at: Instant::now(),
            log_path: self.log_path.clone(),
        });

        match self.confirm_listening(ports).await {
            Ok(()) => {
                self.state = SupervisorState::Running;
                Ok(pid)
            }
            Err(e @ BootstrapError::PortsNotListening(_)) => {
                self.state = SupervisorState::Running;
                Err(e)
            }
            Err(e) => {
                self.process = None;
                self.state = SupervisorState::Idle;
                Err(e)
            }
        }
    }

    async fn confirm_listening(&mut self, ports: &[u16]) -> Result<()> {
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.settings.startup_timeout_secs);

        loop {
            self.check_alive()?;

            if !self.settings.port_check || ports.is_empty() {
                return Ok(());
            }

            let Some(listening) = self.inspect_listening().await else {
                warn!("⚠️ ss 与 netstat 均不可用，跳过端口检查");
                return Ok(());
            };
            let missing: Vec<u16> = ports
                .iter()
                .copied()
                .filter(|p| !listening.contains(p))
                .collect();
            if missing.is_empty() {
                info!("✅ 端口已监听: {:?}", ports);
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.check_alive()?;
                error!("❌ sing-box 存活但端口未监听: {:?}", missing);
                return Err(BootstrapError::PortsNotListening(missing));
            }
            debug!("等待端口监听: {:?}", missing);
            tokio::time::sleep(interval).await;
        }
    }

    fn check_alive(&mut self) -> Result<()> {
        let Some(process) = self.process.as_mut() else {
            return Err(BootstrapError::Supervision("没有正在运行的进程".to_string()));
        };
        if let Some(status) = process.child.try_wait()? {
            let tail = log_tail(&process.log_path, LOG_TAIL_LINES);
            error!("❌ sing-box 启动后退出: {}", status);
            return Err(BootstrapError::ProcessExited(if tail.is_empty() {
                status.to_string()
            } else {
                format!("{} ({})", status, tail)
            }));
        }
        Ok(())
    }

    /// 依次尝试 ss -tuln 与 netstat -tuln，都不可用时返回 None
    async fn inspect_listening(&self) -> Option<BTreeSet<u16>> {
        for tool in ["ss", "netstat"] {
            match self.runner.run(&argv(&[tool, "-tuln"])).await {
                Ok(out) if out.success() => return Some(listening_ports(&out.stdout)),
                Ok(out) => debug!("{} 返回码 {}", tool, out.exit_code),
                Err(e) => debug!("无法执行 {}: {}", tool, e),
            }
        }
        None
    }

    /// SIGTERM 后等待宽限期，超时则强制结束
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(mut process) = self.process.take() else {
            self.state = SupervisorState::Idle;
            return StopOutcome::NotRunning;
        };

        if let Ok(Some(status)) = process.child.try_wait() {
            debug!("sing-box 已经退出: {}", status);
            self.state = SupervisorState::Idle;
            return StopOutcome::NotRunning;
        }

        self.state = SupervisorState::Stopping;
        info!("🛑 停止 sing-box (PID {})", process.pid);
        if let Err(e) = send_sigterm(process.pid) {
            warn!("发送 SIGTERM 失败: {}", e);
        }

        let grace = Duration::from_secs(self.settings.stop_grace_secs);
        let outcome = match tokio::time::timeout(grace, process.child.wait()).await {
            Ok(_) => StopOutcome::Exited,
            Err(_) => {
                warn!("⚠️ sing-box 在 {:?} 内未退出，强制结束", grace);
                if let Err(e) = process.child.kill().await {
                    warn!("强制结束失败: {}", e);
                }
                StopOutcome::ForceKilled
            }
        };

        self.state = SupervisorState::Idle;
        outcome
    }

    /// 等待子进程退出；没有子进程时永远挂起
    pub async fn wait_exit(&mut self) -> io::Result<ExitStatus> {
        match self.process.as_mut() {
            Some(process) => process.child.wait().await,
            None => std::future::pending().await,
        }
    }

    /// 记录意外退出，回到 Idle；返回进程的运行时长
    pub fn mark_crashed(&mut self) -> Option<Duration> {
        self.state = SupervisorState::Crashed;
        let uptime = self.process.take().map(|process| {
            let uptime = process.uptime();
            warn!(
                "💥 sing-box (PID {}) 运行 {} 秒后意外退出: {}",
                process.pid,
                uptime.as_secs(),
                log_tail(&process.log_path, LOG_TAIL_LINES)
            );
            uptime
        });
        self.state = SupervisorState::Idle;
        uptime
    }
}
