//! sing-box 配置文档的生成

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DesiredState;
use crate::ports::ResolvedPorts;
use crate::protocol::Protocol;
use crate::secrets::SecretBundle;
use crate::utils::{BootstrapError, Result};

/// 双栈通配监听地址
pub const LISTEN_ANY: &str = "::";

/// Reality 握手目标端口
const HANDSHAKE_PORT: u16 = 443;

/// XHTTP 入站使用的传输层类型
const XHTTP_TRANSPORT: &str = "httpupgrade";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigDocument {
    pub log: LogSection,
    pub inbounds: Vec<ProtocolInbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    pub users: Vec<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_control: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsSection {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealitySection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealitySection {
    pub enabled: bool,
    pub handshake: Handshake,
    pub private_key: String,
    pub short_id: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub server: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
}

impl ProxyConfigDocument {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 整体重写配置文件：先写临时文件再原子替换
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!("✅ sing-box 配置生成完成: {}", path.display());
        Ok(())
    }
}

pub struct ConfigSynthesizer {
    log_level: String,
}

impl ConfigSynthesizer {
    pub fn new(log_level: impl Into<String>) -> Self {
        Self {
            log_level: log_level.into(),
        }
    }

    /// 为每个启用的协议生成一个入站，没有入站时返回配置错误
    pub fn build(
        &self,
        desired: &DesiredState,
        secrets: &SecretBundle,
        ports: &ResolvedPorts,
    ) -> Result<ProxyConfigDocument> {
        let mut inbounds = Vec::new();
        for protocol in desired.enabled() {
            let Some(port) = ports.get(protocol) else {
                continue;
            };
            inbounds.push(self.inbound(protocol, port, desired, secrets)?);
        }

        if inbounds.is_empty() {
            return Err(BootstrapError::Configuration("没有启用任何协议".to_string()));
        }

        Ok(ProxyConfigDocument {
            log: LogSection {
                level: self.log_level.clone(),
                timestamp: true,
            },
            inbounds,
            outbounds: vec![Outbound {
                kind: "direct".to_string(),
                tag: "direct".to_string(),
            }],
        })
    }

    fn inbound(
        &self,
        protocol: Protocol,
        port: u16,
        desired: &DesiredState,
        secrets: &SecretBundle,
    ) -> Result<ProtocolInbound> {
        let uuid = secrets.uuid.to_string();

        let mut inbound = ProtocolInbound {
            kind: String::new(),
            tag: protocol.tag().to_string(),
            listen: LISTEN_ANY.to_string(),
            listen_port: port,
            users: Vec::new(),
            congestion_control: None,
            masquerade: None,
            transport: None,
            tls: None,
        };

        match protocol {
            Protocol::VlessReality => {
                inbound.kind = "vless".to_string();
                inbound.users = vec![User {
                    uuid: Some(uuid),
                    flow: Some("xtls-rprx-vision".to_string()),
                    ..User::default()
                }];
                inbound.tls = Some(reality_tls(desired, secrets)?);
            }
            // sing-box 没有 xhttp 传输层，XHTTP 监听映射为 httpupgrade + path
            Protocol::XhttpReality => {
                inbound.kind = "vless".to_string();
                inbound.users = vec![User {
                    uuid: Some(uuid),
                    ..User::default()
                }];
                inbound.transport = Some(TransportSection {
                    kind: XHTTP_TRANSPORT.to_string(),
                    path: desired.xhttp_path.clone(),
                });
                inbound.tls = Some(reality_tls(desired, secrets)?);
            }
            Protocol::AnytlsReality => {
                inbound.kind = "anytls".to_string();
                inbound.users = vec![User {
                    name: Some("default".to_string()),
                    password: Some(uuid),
                    ..User::default()
                }];
                inbound.tls = Some(reality_tls(desired, secrets)?);
            }
            Protocol::Tuic => {
                inbound.kind = "tuic".to_string();
                inbound.users = vec![User {
                    uuid: Some(uuid.clone()),
                    password: Some(uuid),
                    ..User::default()
                }];
                inbound.congestion_control = Some("bbr".to_string());
                inbound.tls = Some(certificate_tls(secrets));
            }
            Protocol::Hysteria2 => {
                inbound.kind = "hysteria2".to_string();
                inbound.users = vec![User {
                    password: Some(uuid),
                    ..User::default()
                }];
                if !desired.masquerade.is_empty() {
                    inbound.masquerade = Some(desired.masquerade.clone());
                }
                inbound.tls = Some(certificate_tls(secrets));
            }
        }

        Ok(inbound)
    }
}

fn reality_tls(desired: &DesiredState, secrets: &SecretBundle) -> Result<TlsSection> {
    let keys = &secrets.reality;
    if keys.private_key.trim().is_empty() {
        return Err(BootstrapError::SecretGeneration(
            "Reality 私钥为空，拒绝生成无效监听".to_string(),
        ));
    }
    Ok(TlsSection {
        enabled: true,
        server_name: Some(desired.sni.clone()),
        reality: Some(RealitySection {
            enabled: true,
            handshake: Handshake {
                server: desired.sni.clone(),
                server_port: HANDSHAKE_PORT,
            },
            private_key: keys.private_key.clone(),
            short_id: vec![keys.short_id.clone()],
        }),
        ..TlsSection::default()
    })
}

fn certificate_tls(secrets: &SecretBundle) -> TlsSection {
    TlsSection {
        enabled: true,
        alpn: Some(vec!["h3".to_string()]),
        certificate_path: Some(secrets.tls.cert_path.to_string_lossy().into_owned()),
        key_path: Some(secrets.tls.key_path.to_string_lossy().into_owned()),
        ..TlsSection::default()
    }
}
