//! 启动流程与事件循环
//!
//! 所有可变状态 (子进程、密钥、崩溃计数) 只在 [`Orchestrator::run_until`] 的单一循环中修改，
//! 定时任务只通过 channel 发送信号。

use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DesiredState, Layout, RestartMode, Validator};
use crate::network::{detect_public_ip, HttpFetcher};
use crate::ports::{allocate, ResolvedPorts};
use crate::provision::{Arch, BinaryProvisioner, ProvisionedBinary};
use crate::scheduler::RestartScheduler;
use crate::secrets::{SecretBundle, SecretStore};
use crate::supervisor::ProcessSupervisor;
use crate::synth::ConfigSynthesizer;
use crate::utils::{BootstrapError, CommandRunner, Result};

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);

/// run() 的结束方式，两者进程退出码都为 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 收到 Ctrl-C / SIGTERM
    Terminated,
    /// 已派生新的脱离进程接管
    Handoff,
}

/// 连续崩溃重启的额度
///
/// 运行时长达到 `stable_after` 的进程退出时开始新的计数。
#[derive(Debug, Clone)]
pub struct CrashBudget {
    max: u32,
    stable_after: Duration,
    consecutive: u32,
}

impl CrashBudget {
    pub fn new(max: u32, stable_after: Duration) -> Self {
        Self {
            max,
            stable_after,
            consecutive: 0,
        }
    }

    pub fn record_exit(&mut self, uptime: Option<Duration>) {
        if uptime.is_some_and(|uptime| uptime >= self.stable_after) {
            if self.consecutive > 0 {
                info!("进程已稳定运行 {:?}，崩溃计数清零", self.stable_after);
            }
            self.consecutive = 0;
        }
    }

    /// 申请一次重启，返回本次序号；额度用尽时返回 None
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.consecutive >= self.max {
            return None;
        }
        self.consecutive += 1;
        Some(self.consecutive)
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

enum Event {
    Shutdown,
    Tick,
    Exited(String),
}

pub struct Orchestrator {
    config: AppConfig,
    desired: DesiredState,
    ports: ResolvedPorts,
    layout: Layout,
    fetcher: Arc<dyn HttpFetcher>,
    provisioner: BinaryProvisioner,
    secrets: SecretStore,
    synthesizer: ConfigSynthesizer,
    supervisor: ProcessSupervisor,
    binary: Option<ProvisionedBinary>,
    bundle: Option<SecretBundle>,
    crashes: CrashBudget,
    /// 启动确认期间进程已退出，等待崩溃重启
    engine_down: bool,
}

impl Orchestrator {
    /// 验证配置并分配端口；这里的失败发生在任何网络请求或子进程之前
    pub fn new(
        config: AppConfig,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Result<Self> {
        Validator::validate(&config)?;
        let desired = DesiredState::from_config(&config)?;
        let ports = allocate(&desired.ports, &mut rand::thread_rng())?;
        let arch = Arch::detect()?;

        let layout = config.layout();
        let provisioner = BinaryProvisioner::new(
            layout.clone(),
            config.engine.clone(),
            arch,
            fetcher.clone(),
            runner.clone(),
        );
        let secrets = SecretStore::new(layout.clone(), runner.clone(), config.tls.clone());
        let synthesizer = ConfigSynthesizer::new(config.engine.log_level.clone());
        let supervisor = ProcessSupervisor::new(config.supervisor.clone(), runner, layout.log());
        let crashes = CrashBudget::new(
            config.supervisor.max_crash_restarts,
            Duration::from_secs(config.supervisor.stable_after_secs),
        );

        Ok(Self {
            config,
            desired,
            ports,
            layout,
            fetcher,
            provisioner,
            secrets,
            synthesizer,
            supervisor,
            binary: None,
            bundle: None,
            crashes,
            engine_down: false,
        })
    }

    pub fn ports(&self) -> &ResolvedPorts {
        &self.ports
    }

    pub fn bundle(&self) -> Option<&SecretBundle> {
        self.bundle.as_ref()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// 当前连续崩溃重启次数
    pub fn crash_restarts(&self) -> u32 {
        self.crashes.consecutive()
    }

    /// 获取内核、加载密钥、生成并写入配置
    pub async fn prepare(&mut self, rotate: bool) -> Result<()> {
        let binary = self.provisioner.ensure().await?;

        let bundle = if rotate {
            self.secrets
                .rotate(self.desired.identity, &binary.path)
                .await?
        } else {
            self.secrets
                .load_or_create(self.desired.identity, &binary.path)
                .await?
        };

        let document = self.synthesizer.build(&self.desired, &bundle, &self.ports)?;
        document.write_to(&self.layout.config_json()).await?;

        self.binary = Some(binary);
        self.bundle = Some(bundle);
        Ok(())
    }

    async fn start_engine(&mut self) -> Result<u32> {
        let binary = self
            .binary
            .as_ref()
            .map(|b| b.path.clone())
            .ok_or_else(|| BootstrapError::Supervision("内核尚未准备".to_string()))?;
        let ports = self.ports.distinct_ports();
        self.supervisor
            .start(&binary, &self.layout.config_json(), &ports)
            .await
    }

    /// 完整启动流程；strict 模式下启动监管失败是致命的
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.prepare(false).await?;

        match self.start_engine().await {
            Ok(pid) => {
                info!("✅ sing-box 运行中 (PID {})", pid);
                Ok(())
            }
            Err(e) if e.is_supervision() && !self.config.supervisor.strict => {
                warn!("⚠️ {}，继续运行", e);
                if matches!(e, BootstrapError::ProcessExited(_)) {
                    self.engine_down = true;
                }
                Ok(())
            }
            Err(e) => {
                self.supervisor.stop().await;
                Err(e)
            }
        }
    }

    async fn log_summary(&self) {
        let host = detect_public_ip(
            self.fetcher.as_ref(),
            &self.config.engine.public_ip_url,
            PUBLIC_IP_TIMEOUT,
        )
        .await;

        info!("==================== 节点信息 ====================");
        info!("服务器地址: {}", host);
        if let Some(bundle) = &self.bundle {
            info!("UUID: {}", bundle.uuid);
            if self.desired.needs_reality() {
                info!("SNI: {}", self.desired.sni);
                info!("Reality 公钥: {}", bundle.reality.public_key);
                info!("Short ID: {}", bundle.reality.short_id);
            }
        }
        for (protocol, port) in self.ports.iter() {
            info!("  {:<16} {}:{} ({:?})", protocol, host, port, protocol.transport());
        }
        info!("==================================================");
    }

    /// 安装信号处理后进入 [`Orchestrator::run_until`]，定时任务在返回前结束
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let restart = &self.config.restart;
        let scheduler = if restart.enabled {
            Some(RestartScheduler::from_config(&restart.at, &restart.utc_offset)?)
        } else {
            None
        };
        let shutdown = shutdown_signal()?;

        let (tx, ticks) = mpsc::channel(1);
        let scheduler = match scheduler {
            Some(scheduler) => Some(scheduler.spawn(tx)),
            None => {
                info!("定时重启未启用");
                drop(tx);
                None
            }
        };

        let result = self.run_until(shutdown, ticks).await;

        if let Some(handle) = scheduler {
            handle.abort();
        }
        result
    }

    /// 启动后处理事件直到 shutdown 完成或交接；返回前总是停止子进程
    pub async fn run_until<S>(&mut self, shutdown: S, mut ticks: mpsc::Receiver<()>) -> Result<RunOutcome>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let result = self.drive(&mut shutdown, &mut ticks).await;
        self.supervisor.stop().await;
        result
    }

    async fn drive<S>(&mut self, shutdown: &mut S, ticks: &mut mpsc::Receiver<()>) -> Result<RunOutcome>
    where
        S: Future<Output = ()> + Unpin,
    {
        let booted = tokio::select! {
            result = self.bootstrap() => Some(result),
            _ = &mut *shutdown => None,
        };
        match booted {
            Some(result) => result?,
            None => {
                info!("🛑 启动期间收到终止信号，正在退出");
                return Ok(RunOutcome::Terminated);
            }
        }
        self.log_summary().await;

        self.event_loop(shutdown, ticks).await
    }

    async fn event_loop<S>(&mut self, shutdown: &mut S, ticks: &mut mpsc::Receiver<()>) -> Result<RunOutcome>
    where
        S: Future<Output = ()> + Unpin,
    {
        loop {
            if std::mem::take(&mut self.engine_down) && self.recover_crash(shutdown).await {
                info!("🛑 收到终止信号，正在退出");
                return Ok(RunOutcome::Terminated);
            }

            let event = tokio::select! {
                _ = &mut *shutdown => Event::Shutdown,
                Some(()) = ticks.recv() => Event::Tick,
                status = self.supervisor.wait_exit() => Event::Exited(match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                }),
            };

            match event {
                Event::Shutdown => {
                    info!("🛑 收到终止信号，正在退出");
                    return Ok(RunOutcome::Terminated);
                }
                Event::Tick => {
                    if let Some(outcome) = self.restart_cycle(shutdown).await {
                        return Ok(outcome);
                    }
                }
                Event::Exited(status) => {
                    warn!("sing-box 退出: {}", status);
                    let uptime = self.supervisor.mark_crashed();
                    self.crashes.record_exit(uptime);
                    self.engine_down = true;
                }
            }
        }
    }

    /// 按退避策略重启崩溃的内核；等待期间 shutdown 完成时返回 true
    async fn recover_crash<S>(&mut self, shutdown: &mut S) -> bool
    where
        S: Future<Output = ()> + Unpin,
    {
        let policy = self.config.supervisor.clone();
        if !policy.restart_on_crash {
            warn!("未启用崩溃重启，等待下次定时重启");
            return false;
        }

        loop {
            let Some(attempt) = self.crashes.next_attempt() else {
                error!(
                    "❌ 已连续重启 {} 次，等待下次定时重启",
                    self.crashes.consecutive()
                );
                return false;
            };
            warn!(
                "🔁 {} 秒后进行第 {} 次崩溃重启",
                policy.crash_backoff_secs, attempt
            );

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(policy.crash_backoff_secs)) => {}
                _ = &mut *shutdown => return true,
            }

            match self.start_engine().await {
                Ok(pid) => {
                    info!("✅ sing-box 已恢复 (PID {})", pid);
                    return false;
                }
                Err(e @ BootstrapError::ProcessExited(_)) => warn!("⚠️ {}", e),
                Err(e) => {
                    warn!("⚠️ {}", e);
                    return false;
                }
            }
        }
    }

    /// 定时重启；失败只记录日志，调度继续
    ///
    /// 端口释放等待期间 shutdown 完成时返回 `Some(Terminated)`。
    pub async fn restart_cycle<S>(&mut self, shutdown: &mut S) -> Option<RunOutcome>
    where
        S: Future<Output = ()> + Unpin,
    {
        info!("🔄 定时重启 sing-box...");
        let outcome = self.supervisor.stop().await;
        info!("旧进程已停止: {:?}", outcome);

        let release = Duration::from_secs(self.config.restart.socket_release_secs);
        tokio::select! {
            _ = tokio::time::sleep(release) => {}
            _ = &mut *shutdown => {
                info!("🛑 收到终止信号，正在退出");
                return Some(RunOutcome::Terminated);
            }
        }

        let restart = self.config.restart.clone();
        let mut rotate = restart.rotate_secrets;
        if restart.mode == RestartMode::Relaunch {
            if rotate {
                match self.rotate_before_handoff().await {
                    Ok(()) => rotate = false,
                    Err(e) => error!("❌ 密钥轮换失败: {}", e),
                }
            }
            let program = match &restart.relaunch_program {
                Some(program) => Ok(program.clone()),
                None => std::env::current_exe(),
            };
            match program.and_then(|program| relaunch(&program, &self.layout.warden_log())) {
                Ok(pid) => {
                    info!("✅ 新进程已接管 (PID {})，当前进程退出", pid);
                    return Some(RunOutcome::Handoff);
                }
                Err(e) => error!("❌ 派生新进程失败: {}，改为进程内重启", e),
            }
        }

        let started = match self.prepare(rotate).await {
            Ok(()) => self.start_engine().await,
            Err(e) => Err(e),
        };
        match started {
            Ok(pid) => {
                self.crashes.reset();
                info!("✅ 定时重启完成 (PID {})", pid);
            }
            Err(e) => {
                error!("❌ 定时重启失败: {}", e);
                if matches!(e, BootstrapError::ProcessExited(_)) {
                    self.engine_down = true;
                }
            }
        }
        None
    }

    async fn rotate_before_handoff(&mut self) -> Result<()> {
        let binary = self
            .binary
            .as_ref()
            .map(|b| b.path.clone())
            .ok_or_else(|| BootstrapError::Supervision("内核尚未准备".to_string()))?;
        self.bundle = Some(self.secrets.rotate(self.desired.identity, &binary).await?);
        Ok(())
    }
}

/// Ctrl-C 或 SIGTERM 任一到达时完成
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    })
}

/// 以相同参数派生脱离会话的新进程
fn relaunch(program: &Path, log_path: &Path) -> io::Result<u32> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let log = OpenOptions::new().create(true).append(true).open(log_path)?;
    let log_err = log.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(std::env::args_os().skip(1))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    // SAFETY: pre_exec 闭包只调用异步信号安全的 setsid
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    Ok(child.id())
}
