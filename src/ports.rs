use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use rand::Rng;
use tracing::{info, warn};

use crate::protocol::Protocol;
use crate::utils::{BootstrapError, Result};

/// 自动分配端口的范围
pub const AUTO_PORT_RANGE: RangeInclusive<u16> = 20000..=59999;

/// 线性探测越过 65535 后回到此端口
const SEARCH_WRAP_START: u16 = 1024;

/// 随机挑选的尝试次数，之后在范围内顺序扫描
const AUTO_RANDOM_TRIES: usize = 64;

/// 单个协议的端口请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRequest {
    Disabled,
    Explicit(u16),
    Auto,
    /// 与另一协议共用端口 (例如 TCP 的 Reality 与 UDP 的 Hysteria2)
    Share(Protocol),
}

impl PortRequest {
    /// 解析文本形式：空 / 0 = 禁用，数字，auto，share:<协议> / same:<协议>
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() || text == "0" {
            return Ok(PortRequest::Disabled);
        }
        if text.eq_ignore_ascii_case("auto") {
            return Ok(PortRequest::Auto);
        }
        let lower = text.to_ascii_lowercase();
        if let Some(target) = lower
            .strip_prefix("share:")
            .or_else(|| lower.strip_prefix("same:"))
        {
            let protocol = target.parse::<Protocol>().map_err(BootstrapError::Configuration)?;
            return Ok(PortRequest::Share(protocol));
        }
        match text.parse::<u32>() {
            Ok(port) if (1..=u16::MAX as u32).contains(&port) => Ok(PortRequest::Explicit(port as u16)),
            _ => Err(BootstrapError::Configuration(format!("无效端口: {}", text))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, PortRequest::Disabled)
    }
}

/// 分配结果，按声明顺序迭代
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPorts {
    ports: BTreeMap<Protocol, u16>,
}

impl ResolvedPorts {
    pub fn get(&self, protocol: Protocol) -> Option<u16> {
        self.ports.get(&protocol).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Protocol, u16)> + '_ {
        self.ports.iter().map(|(p, port)| (*p, *port))
    }

    /// 去重后的端口，用于监听检查
    pub fn distinct_ports(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.ports.values().copied().collect();
        set.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

fn next_port(port: u16) -> u16 {
    if port == u16::MAX {
        SEARCH_WRAP_START
    } else {
        port + 1
    }
}

/// 从 start 开始线性探测下一个未占用端口
fn next_free_from(start: u16, claimed: &BTreeSet<u16>) -> Option<u16> {
    let mut port = start;
    // 可用端口总数为 u16::MAX，最多走一圈
    for _ in 0..u16::MAX {
        if !claimed.contains(&port) {
            return Some(port);
        }
        port = next_port(port);
    }
    None
}

fn pick_auto<R: Rng>(claimed: &BTreeSet<u16>, rng: &mut R) -> Option<u16> {
    for _ in 0..AUTO_RANDOM_TRIES {
        let port = rng.gen_range(AUTO_PORT_RANGE);
        if !claimed.contains(&port) {
            return Some(port);
        }
    }
    let start = rng.gen_range(AUTO_PORT_RANGE);
    AUTO_PORT_RANGE
        .clone()
        .cycle()
        .skip((start - AUTO_PORT_RANGE.start()) as usize)
        .take(AUTO_PORT_RANGE.len())
        .find(|p| !claimed.contains(p))
}

/// 把期望端口解析为无冲突的端口集合
///
/// 按声明顺序处理：本次运行中已被占用的显式端口向上线性探测，auto 在
/// [`AUTO_PORT_RANGE`] 内随机挑选；share 在其余协议分配完成后取目标协议的端口。
pub fn allocate<R: Rng>(
    requests: &[(Protocol, PortRequest)],
    rng: &mut R,
) -> Result<ResolvedPorts> {
    let mut claimed = BTreeSet::new();
    let mut resolved = BTreeMap::new();

    for (protocol, request) in requests {
        let port = match *request {
            PortRequest::Explicit(wanted) => {
                let port = next_free_from(wanted, &claimed).ok_or_else(|| {
                    BootstrapError::Configuration("没有可用端口".to_string())
                })?;
                if port != wanted {
                    warn!("⚠️ {} 端口 {} 已被本次分配占用，改用 {}", protocol, wanted, port);
                }
                port
            }
            PortRequest::Auto => {
                let port = pick_auto(&claimed, rng).ok_or_else(|| {
                    BootstrapError::Configuration("自动端口范围已耗尽".to_string())
                })?;
                info!("🎲 {} 自动分配端口 {}", protocol, port);
                port
            }
            PortRequest::Disabled | PortRequest::Share(_) => continue,
        };
        claimed.insert(port);
        resolved.insert(*protocol, port);
    }

    for (protocol, request) in requests {
        let PortRequest::Share(target) = *request else {
            continue;
        };
        if target == *protocol {
            return Err(BootstrapError::Configuration(format!(
                "{} 不能与自身共用端口",
                protocol
            )));
        }
        let port = resolved.get(&target).copied().ok_or_else(|| {
            BootstrapError::Configuration(format!(
                "{} 要求共用 {} 的端口，但 {} 未启用或自身也是共用",
                protocol, target, target
            ))
        })?;
        info!("🔗 {} 与 {} 共用端口 {}", protocol, target, port);
        resolved.insert(*protocol, port);
    }

    Ok(ResolvedPorts { ports: resolved })
}
