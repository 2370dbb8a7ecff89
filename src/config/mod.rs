use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod desired;
mod layout;
mod validator;

pub use desired::{DesiredState, Identity};
pub use layout::Layout;
pub use validator::Validator;

use crate::protocol::Protocol;
use crate::utils::Result;

/// 声明式配置 (config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 固定 UUID，或 "auto" 表示首次生成后持久化
    #[serde(default)]
    pub uuid: String,
    #[serde(default = "default_sni")]
    pub sni: String,
    /// Hysteria2 伪装目标
    #[serde(default = "default_masquerade")]
    pub masquerade: String,
    #[serde(default = "default_xhttp_path")]
    pub xhttp_path: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_sni() -> String {
    "www.bing.com".to_string()
}

fn default_masquerade() -> String {
    "https://bing.com".to_string()
}

fn default_xhttp_path() -> String {
    "/".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".singbox")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            sni: default_sni(),
            masquerade: default_masquerade(),
            xhttp_path: default_xhttp_path(),
            work_dir: default_work_dir(),
            ports: PortsConfig::default(),
            engine: EngineConfig::default(),
            tls: TlsConfig::default(),
            supervisor: SupervisorConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

/// 端口字段既可以写数字，也可以写 "auto" / "share:tuic" 之类的文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl Default for PortValue {
    fn default() -> Self {
        PortValue::Text(String::new())
    }
}

impl PortValue {
    pub fn as_text(&self) -> String {
        match self {
            PortValue::Number(n) => n.to_string(),
            PortValue::Text(s) => s.trim().to_string(),
        }
    }
}

/// 各协议端口，空或 0 表示禁用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub vless_reality: PortValue,
    pub tuic: PortValue,
    pub hysteria2: PortValue,
    pub xhttp_reality: PortValue,
    pub anytls_reality: PortValue,
}

impl PortsConfig {
    pub fn get(&self, protocol: Protocol) -> &PortValue {
        match protocol {
            Protocol::VlessReality => &self.vless_reality,
            Protocol::Tuic => &self.tuic,
            Protocol::Hysteria2 => &self.hysteria2,
            Protocol::XhttpReality => &self.xhttp_reality,
            Protocol::AnytlsReality => &self.anytls_reality,
        }
    }

    pub fn set(&mut self, protocol: Protocol, value: PortValue) {
        let slot = match protocol {
            Protocol::VlessReality => &mut self.vless_reality,
            Protocol::Tuic => &mut self.tuic,
            Protocol::Hysteria2 => &mut self.hysteria2,
            Protocol::XhttpReality => &mut self.xhttp_reality,
            Protocol::AnytlsReality => &mut self.anytls_reality,
        };
        *slot = value;
    }
}

/// 内核 (sing-box) 获取与运行参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary_name: String,
    /// 版本查询失败时使用的最后已知可用版本
    pub fallback_version: String,
    pub release_api: String,
    pub download_base: String,
    /// 镜像前缀，按顺序拼接在主下载地址之前
    pub mirrors: Vec<String>,
    /// 小于此大小的压缩包视为截断或错误页
    pub min_archive_bytes: u64,
    pub lookup_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// 写入 config.json 的内核日志级别
    pub log_level: String,
    pub public_ip_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_name: "sing-box".to_string(),
            fallback_version: "v1.12.12".to_string(),
            release_api: "https://api.github.com/repos/SagerNet/sing-box/releases/latest".to_string(),
            download_base: "https://github.com/SagerNet/sing-box/releases/download".to_string(),
            mirrors: vec!["https://mirror.ghproxy.com/".to_string()],
            min_archive_bytes: 1_000_000,
            lookup_timeout_secs: 5,
            download_timeout_secs: 120,
            log_level: "info".to_string(),
            public_ip_url: "https://api.ipify.org".to_string(),
        }
    }
}

/// 自签证书参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub common_name: String,
    pub days: u32,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            common_name: "bing.com".to_string(),
            days: 3650,
        }
    }
}

/// 进程监管参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 启动后通过 ss/netstat 确认端口监听
    pub port_check: bool,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stop_grace_secs: u64,
    /// 启动失败是否致命
    pub strict: bool,
    pub restart_on_crash: bool,
    pub crash_backoff_secs: u64,
    pub max_crash_restarts: u32,
    /// 运行超过此时长后退出不再计入连续崩溃
    pub stable_after_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port_check: true,
            startup_timeout_secs: 15,
            poll_interval_ms: 1000,
            stop_grace_secs: 5,
            strict: false,
            restart_on_crash: true,
            crash_backoff_secs: 10,
            max_crash_restarts: 5,
            stable_after_secs: 60,
        }
    }
}

/// 每日重启方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// 当前进程重新执行启动流程
    InProcess,
    /// 派生脱离的新进程后当前进程退出
    Relaunch,
}

/// 定时重启参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enabled: bool,
    /// 本地时间 HH:MM 或 HH:MM:SS
    pub at: String,
    /// 时区偏移，例如 +08:00 (北京时间)
    pub utc_offset: String,
    /// 重启时是否重新生成 Reality 密钥和证书（会使已分发的链接失效）
    pub rotate_secrets: bool,
    pub mode: RestartMode,
    /// 停止后等待端口释放的时间
    pub socket_release_secs: u64,
    /// relaunch 模式派生的程序，默认为当前可执行文件
    pub relaunch_program: Option<PathBuf>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: "00:00".to_string(),
            utc_offset: "+08:00".to_string(),
            rotate_secrets: false,
            mode: RestartMode::InProcess,
            socket_release_secs: 3,
            relaunch_program: None,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置，应用环境变量覆盖后验证
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            info!("📄 已读取配置文件 {}", path.display());
            config
        } else {
            warn!("配置文件 {} 不存在，使用默认值与环境变量", path.display());
            AppConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        // 验证配置
        Validator::validate(&config)?;

        Ok(config)
    }

    /// 应用覆盖值，优先级：环境变量 > 配置文件 > 默认值
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(uuid) = get("UUID") {
            self.uuid = uuid;
        }
        if let Some(sni) = get("SNI") {
            self.sni = sni;
        }
        if let Some(dir) = get("FILE_PATH") {
            self.work_dir = PathBuf::from(dir);
        }
        for protocol in Protocol::ALL {
            if let Some(port) = get(protocol.port_env_var()) {
                self.ports.set(protocol, PortValue::Text(port));
            }
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.work_dir, &self.engine.binary_name)
    }
}
