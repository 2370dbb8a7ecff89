use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 由 sing-box 承载的入站协议
///
/// 变体顺序即声明顺序：端口分配与配置生成都按此顺序进行。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    VlessReality,
    Tuic,
    Hysteria2,
    XhttpReality,
    AnytlsReality,
}

/// 协议使用的传输层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::VlessReality,
        Protocol::Tuic,
        Protocol::Hysteria2,
        Protocol::XhttpReality,
        Protocol::AnytlsReality,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::VlessReality => "vless-reality",
            Protocol::Tuic => "tuic",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::XhttpReality => "xhttp-reality",
            Protocol::AnytlsReality => "anytls-reality",
        }
    }

    /// sing-box 入站 tag
    pub fn tag(self) -> &'static str {
        match self {
            Protocol::VlessReality => "vless-reality-in",
            Protocol::Tuic => "tuic-in",
            Protocol::Hysteria2 => "hy2-in",
            Protocol::XhttpReality => "xhttp-reality-in",
            Protocol::AnytlsReality => "anytls-reality-in",
        }
    }

    /// 是否需要 Reality 密钥 (handshake + private_key + short_id)
    pub fn uses_reality(self) -> bool {
        matches!(
            self,
            Protocol::VlessReality | Protocol::XhttpReality | Protocol::AnytlsReality
        )
    }

    pub fn transport(self) -> Transport {
        match self {
            Protocol::Tuic | Protocol::Hysteria2 => Transport::Udp,
            _ => Transport::Tcp,
        }
    }

    /// 覆盖端口的环境变量名
    pub fn port_env_var(self) -> &'static str {
        match self {
            Protocol::VlessReality => "REALITY_PORT",
            Protocol::Tuic => "TUIC_PORT",
            Protocol::Hysteria2 => "HY2_PORT",
            Protocol::XhttpReality => "XHTTP_PORT",
            Protocol::AnytlsReality => "ANYTLS_PORT",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "vless-reality" | "reality" | "vless" => Ok(Protocol::VlessReality),
            "tuic" => Ok(Protocol::Tuic),
            "hysteria2" | "hy2" => Ok(Protocol::Hysteria2),
            "xhttp-reality" | "xhttp" => Ok(Protocol::XhttpReality),
            "anytls-reality" | "anytls" => Ok(Protocol::AnytlsReality),
            _ => Err(format!("未知协议: {}", s)),
        }
    }
}
