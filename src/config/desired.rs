use uuid::Uuid;

use super::AppConfig;
use crate::ports::PortRequest;
use crate::protocol::Protocol;
use crate::utils::{BootstrapError, Result};

/// 身份 (UUID) 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Fixed(Uuid),
    /// 首次运行生成并持久化
    Auto,
}

impl Identity {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BootstrapError::Configuration("uuid 不能为空".to_string()));
        }
        if text.eq_ignore_ascii_case("auto") {
            return Ok(Identity::Auto);
        }
        Uuid::parse_str(text)
            .map(Identity::Fixed)
            .map_err(|_| BootstrapError::Configuration(format!("uuid 格式无效: {}", text)))
    }
}

/// 启动时加载一次的期望状态，之后不可变
#[derive(Debug, Clone)]
pub struct DesiredState {
    pub identity: Identity,
    /// 按声明顺序排列
    pub ports: Vec<(Protocol, PortRequest)>,
    pub sni: String,
    pub masquerade: String,
    pub xhttp_path: String,
}

impl DesiredState {
    /// 从配置构造，缺少身份或没有启用任何协议时返回配置错误
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let identity = Identity::parse(&config.uuid)?;

        let ports = Protocol::ALL
            .iter()
            .map(|p| Ok((*p, PortRequest::parse(&config.ports.get(*p).as_text())?)))
            .collect::<Result<Vec<_>>>()?;

        if !ports.iter().any(|(_, r)| r.is_enabled()) {
            return Err(BootstrapError::Configuration("未配置任何端口".to_string()));
        }

        Ok(Self {
            identity,
            ports,
            sni: config.sni.trim().to_string(),
            masquerade: config.masquerade.trim().to_string(),
            xhttp_path: config.xhttp_path.trim().to_string(),
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.ports
            .iter()
            .filter(|(_, r)| r.is_enabled())
            .map(|(p, _)| *p)
    }

    pub fn needs_reality(&self) -> bool {
        self.enabled().any(|p| p.uses_reality())
    }
}
