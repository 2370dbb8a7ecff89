//! sing-box 内核的获取与校验

pub mod elf;
pub mod release;

pub use elf::ElfCheck;
pub use release::Arch;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{EngineConfig, Layout};
use crate::network::HttpFetcher;
use crate::utils::{BootstrapError, CommandRunner, Result};
use release::{archive_name, download_urls, extract_tag_name};

/// 已就绪的内核可执行文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedBinary {
    pub version: String,
    pub arch: Arch,
    pub path: PathBuf,
    /// 通过了 ELF 头检查
    pub validated: bool,
}

pub struct BinaryProvisioner {
    layout: Layout,
    engine: EngineConfig,
    arch: Arch,
    fetcher: Arc<dyn HttpFetcher>,
    runner: Arc<dyn CommandRunner>,
}

/// 递归查找名为 name 的普通文件
fn find_named(dir: &Path, name: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            found.extend(find_named(&path, name)?);
        } else if file_type.is_file() && entry.file_name() == name {
            found.push(path);
        }
    }
    Ok(found)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // 跨文件系统时退回复制
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

impl BinaryProvisioner {
    pub fn new(
        layout: Layout,
        engine: EngineConfig,
        arch: Arch,
        fetcher: Arc<dyn HttpFetcher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout,
            engine,
            arch,
            fetcher,
            runner,
        }
    }

    /// 确保规范路径下存在有效的内核
    ///
    /// 本地已有有效文件时不发起任何网络请求；否则依次尝试主地址和镜像，
    /// 全部失败时返回致命错误，绝不使用未校验的文件继续。
    pub async fn ensure(&self) -> Result<ProvisionedBinary> {
        tokio::fs::create_dir_all(self.layout.root()).await?;
        let path = self.layout.binary();

        if path.exists() {
            match elf::inspect_file(&path, self.arch)? {
                ElfCheck::Valid => {
                    make_executable(&path).await?;
                    let version = tokio::fs::read_to_string(self.layout.version_file())
                        .await
                        .map(|v| v.trim().to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    info!("🔎 发现本地 {} ({})，可执行", self.layout.binary_name(), version);
                    return Ok(ProvisionedBinary {
                        version,
                        arch: self.arch,
                        path,
                        validated: true,
                    });
                }
                check => warn!("⚠️ 本地 {} 校验失败 ({:?})，重新下载", path.display(), check),
            }
        }

        let tag = self.resolve_version().await;
        let file = archive_name(self.layout.binary_name(), &tag, self.arch);
        let urls = download_urls(&self.engine.download_base, &self.engine.mirrors, &tag, &file);

        let mut failures = Vec::new();
        for url in &urls {
            info!("⬇️ 尝试下载: {}", url);
            let outcome = self.try_source(url).await;
            self.cleanup().await;
            match outcome {
                Ok(()) => {
                    tokio::fs::write(self.layout.version_file(), format!("{}\n", tag)).await?;
                    info!("✅ 成功下载并准备 {} {}", self.layout.binary_name(), tag);
                    return Ok(ProvisionedBinary {
                        version: tag,
                        arch: self.arch,
                        path,
                        validated: true,
                    });
                }
                Err(reason) => {
                    warn!("⚠️ 下载源失败: {}", reason);
                    failures.push(format!("{} ({})", url, reason));
                }
            }
        }

        Err(BootstrapError::Provisioning(format!(
            "所有下载源均失败: {}",
            failures.join("; ")
        )))
    }

    /// 查询最新版本，任何失败都回退到内置版本
    pub async fn resolve_version(&self) -> String {
        let fallback = self.engine.fallback_version.clone();
        let timeout = Duration::from_secs(self.engine.lookup_timeout_secs);
        match self.fetcher.get_text(&self.engine.release_api, timeout).await {
            Ok(body) => match extract_tag_name(&body) {
                Some(tag) => {
                    info!("🔍 检测到 sing-box 最新版本: {}", tag);
                    tag
                }
                None => {
                    warn!("⚠️ release 元数据中没有 tag_name，使用回退版本 {}", fallback);
                    fallback
                }
            },
            Err(e) => {
                warn!("⚠️ 获取最新版本失败: {}，使用回退版本 {}", e, fallback);
                fallback
            }
        }
    }

    async fn try_source(&self, url: &str) -> std::result::Result<(), String> {
        let archive = self.layout.archive();
        let timeout = Duration::from_secs(self.engine.download_timeout_secs);

        self.fetcher
            .download(url, &archive, timeout)
            .await
            .map_err(|e| format!("下载失败: {}", e))?;

        let size = tokio::fs::metadata(&archive)
            .await
            .map(|m| m.len())
            .map_err(|e| format!("读取下载文件失败: {}", e))?;
        if size < self.engine.min_archive_bytes {
            return Err(format!(
                "文件太小 ({} 字节 < {})",
                size, self.engine.min_archive_bytes
            ));
        }

        let staging = self.layout.staging();
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| format!("创建解压目录失败: {}", e))?;

        let argv = vec![
            "tar".to_string(),
            "-xzf".to_string(),
            archive.to_string_lossy().into_owned(),
            "-C".to_string(),
            staging.to_string_lossy().into_owned(),
        ];
        let out = self
            .runner
            .run(&argv)
            .await
            .map_err(|e| format!("无法执行 tar: {}", e))?;
        if !out.success() {
            return Err(format!("解压失败，返回码 {}", out.exit_code));
        }

        let candidates = find_named(&staging, self.layout.binary_name())
            .map_err(|e| format!("扫描解压目录失败: {}", e))?;
        let extracted = match candidates.as_slice() {
            [single] => single.clone(),
            [] => return Err(format!("解压后未找到 {}", self.layout.binary_name())),
            many => return Err(format!("解压后找到 {} 个 {}", many.len(), self.layout.binary_name())),
        };

        let dest = self.layout.binary();
        move_file(&extracted, &dest)
            .await
            .map_err(|e| format!("移动可执行文件失败: {}", e))?;

        let check = elf::inspect_file(&dest, self.arch).map_err(|e| e.to_string())?;
        if check != ElfCheck::Valid {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(format!("可执行文件校验失败: {:?}", check));
        }
        make_executable(&dest).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(self.layout.archive()).await;
        let _ = tokio::fs::remove_dir_all(self.layout.staging()).await;
    }
}
