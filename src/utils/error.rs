use thiserror::Error;

/// 引导器错误类型
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// 缺少身份或没有任何协议启用，必须在触碰外部进程之前失败
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内核准备失败: {0}")]
    Provisioning(String),

    /// 密钥/证书生成失败，绝不回退为空字符串
    #[error("密钥生成失败: {0}")]
    SecretGeneration(String),

    #[error("sing-box 进程提前退出: {0}")]
    ProcessExited(String),

    #[error("sing-box 存活但端口未监听: {0:?}")]
    PortsNotListening(Vec<u16>),

    #[error("进程监管错误: {0}")]
    Supervision(String),

    #[error("定时重启失败: {0}")]
    Scheduling(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("UUID 解析错误: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("JSON 解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML 解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl BootstrapError {
    /// 进程启动阶段的失败，是否致命由 strict 设置决定
    pub fn is_supervision(&self) -> bool {
        matches!(
            self,
            Self::ProcessExited(_) | Self::PortsNotListening(_) | Self::Supervision(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
