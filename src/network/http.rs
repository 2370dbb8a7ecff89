use std::io;
use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 版本查询、下载、公网 IP 检测共用的 HTTP 能力
///
/// 每次调用都带显式超时，测试中替换为计数的假实现。
pub trait HttpFetcher: Send + Sync {
    /// GET 并返回响应正文
    fn get_text<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<String>>;

    /// GET 并写入 dest，返回写入的字节数
    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<u64>>;
}

fn to_io(e: reqwest::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// 基于 reqwest 的实现
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(connect_timeout: Duration) -> io::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("box-warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(to_io)?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn get_text<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<String>> {
        Box::pin(async move {
            debug!("GET {}", url);
            let response = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
                .timeout(timeout)
                .send()
                .await
                .map_err(to_io)?
                .error_for_status()
                .map_err(to_io)?;
            response.text().await.map_err(to_io)
        })
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<u64>> {
        Box::pin(async move {
            debug!("下载 {} -> {}", url, dest.display());
            let response = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(to_io)?
                .error_for_status()
                .map_err(to_io)?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = response.bytes_stream();
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(to_io)?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(written)
        })
    }
}
