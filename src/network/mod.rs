pub mod http;

pub use http::{HttpFetcher, ReqwestFetcher};

use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, warn};

/// 公网 IP 检测失败时的回退值
pub const FALLBACK_HOST: &str = "127.0.0.1";

/// 检测公网 IP，失败时回退为本地地址
pub async fn detect_public_ip(fetcher: &dyn HttpFetcher, url: &str, timeout: Duration) -> String {
    match fetcher.get_text(url, timeout).await {
        Ok(body) => {
            let candidate = body.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                debug!("公网 IP: {}", candidate);
                return candidate.to_string();
            }
            warn!("公网 IP 服务返回无效内容，使用回退地址 {}", FALLBACK_HOST);
        }
        Err(e) => warn!("公网 IP 检测失败: {}，使用回退地址 {}", e, FALLBACK_HOST),
    }
    FALLBACK_HOST.to_string()
}
