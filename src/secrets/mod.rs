//! 密钥与证书的持久化
//!
//! 一旦生成，UUID、Reality 密钥对和自签证书在重启之间保持不变，
//! 除非显式调用 [`SecretStore::rotate`]；否则已分发的客户端链接会失效。

mod parser;

pub use parser::{parse_keys, render_keys, KeyParse, ParsedKeys};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Identity, Layout, TlsConfig};
use crate::utils::{
    generate_short_id, verify_reality_keypair, BootstrapError, CommandRunner, Result,
};

/// Reality 密钥 (Base64, sing-box 格式)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityKeys {
    pub private_key: String,
    pub public_key: String,
    pub short_id: String,
}

/// 自签证书文件位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBundle {
    pub uuid: Uuid,
    pub reality: RealityKeys,
    pub tls: TlsMaterial,
}

pub struct SecretStore {
    layout: Layout,
    runner: Arc<dyn CommandRunner>,
    tls: TlsConfig,
}

fn secret_error(msg: impl Into<String>) -> BootstrapError {
    BootstrapError::SecretGeneration(msg.into())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl SecretStore {
    pub fn new(layout: Layout, runner: Arc<dyn CommandRunner>, tls: TlsConfig) -> Self {
        Self { layout, runner, tls }
    }

    /// 读取已持久化的密钥，缺失时生成一次
    pub async fn load_or_create(&self, identity: Identity, binary: &Path) -> Result<SecretBundle> {
        tokio::fs::create_dir_all(self.layout.root()).await?;

        let uuid = self.resolve_identity(identity).await?;
        let reality = self.ensure_reality_keys(binary).await?;
        let tls = self.ensure_certificate().await?;

        Ok(SecretBundle { uuid, reality, tls })
    }

    /// 删除 Reality 密钥与证书后重新生成，UUID 保持不变
    pub async fn rotate(&self, identity: Identity, binary: &Path) -> Result<SecretBundle> {
        warn!("♻️ 轮换 Reality 密钥与自签证书，已分发的链接将失效");
        remove_optional(&self.layout.reality_key()).await?;
        remove_optional(&self.layout.cert()).await?;
        remove_optional(&self.layout.cert_key()).await?;
        self.load_or_create(identity, binary).await
    }

    async fn resolve_identity(&self, identity: Identity) -> Result<Uuid> {
        match identity {
            Identity::Fixed(uuid) => Ok(uuid),
            Identity::Auto => {
                let path = self.layout.uuid_file();
                if let Some(text) = read_optional(&path).await? {
                    return Ok(Uuid::parse_str(text.trim())?);
                }
                let uuid = Uuid::new_v4();
                tokio::fs::write(&path, format!("{}\n", uuid)).await?;
                info!("🆔 已生成 UUID 并保存到 {}", path.display());
                Ok(uuid)
            }
        }
    }

    async fn ensure_reality_keys(&self, binary: &Path) -> Result<RealityKeys> {
        let path = self.layout.reality_key();

        if let Some(text) = read_optional(&path).await? {
            match parse_keys(&text) {
                KeyParse::Parsed(keys) => {
                    verify_reality_keypair(&keys.private_key, &keys.public_key).map_err(|e| {
                        secret_error(format!(
                            "{} 中的密钥已损坏 ({})，确认后删除该文件以重新生成",
                            path.display(),
                            e
                        ))
                    })?;
                    info!("🔑 reality_key 已存在，跳过生成");
                    return self.complete(keys, &path, false).await;
                }
                KeyParse::MissingField(field) => {
                    warn!("{} 缺少 {}，重新生成", path.display(), field);
                }
            }
        }

        self.generate_reality_keys(binary, &path).await
    }

    async fn generate_reality_keys(&self, binary: &Path, path: &Path) -> Result<RealityKeys> {
        info!("🔐 生成 Reality keypair...");
        let argv = vec![
            binary.to_string_lossy().into_owned(),
            "generate".to_string(),
            "reality-keypair".to_string(),
        ];
        let output = self
            .runner
            .run(&argv)
            .await
            .map_err(|e| secret_error(format!("无法执行 {}: {}", argv[0], e)))?;
        if !output.success() {
            return Err(secret_error(format!(
                "generate reality-keypair 返回码 {}",
                output.exit_code
            )));
        }

        let keys = match parse_keys(&output.stdout) {
            KeyParse::Parsed(keys) => keys,
            KeyParse::MissingField(field) => {
                return Err(secret_error(format!(
                    "generate reality-keypair 输出缺少 {}",
                    field
                )))
            }
        };
        verify_reality_keypair(&keys.private_key, &keys.public_key)?;

        let keys = self.complete(keys, path, true).await?;
        info!("✅ Reality keypair 生成并保存");
        Ok(keys)
    }

    /// 补全 Short ID；新生成或补全时写回文件
    async fn complete(&self, keys: ParsedKeys, path: &Path, fresh: bool) -> Result<RealityKeys> {
        let (short_id, dirty) = match keys.short_id {
            Some(sid) => (sid, fresh),
            None => (generate_short_id(), true),
        };
        let reality = RealityKeys {
            private_key: keys.private_key,
            public_key: keys.public_key,
            short_id,
        };
        if dirty {
            let text = render_keys(&reality.private_key, &reality.public_key, &reality.short_id);
            tokio::fs::write(path, text).await?;
            restrict_permissions(path).await?;
        }
        Ok(reality)
    }

    fn openssl_argv(&self, newkey: &[&str]) -> Vec<String> {
        let mut argv = vec!["openssl".to_string(), "req".to_string(), "-x509".to_string()];
        argv.extend(newkey.iter().map(|s| s.to_string()));
        argv.extend([
            "-keyout".to_string(),
            self.layout.cert_key().to_string_lossy().into_owned(),
            "-out".to_string(),
            self.layout.cert().to_string_lossy().into_owned(),
            "-subj".to_string(),
            format!("/CN={}", self.tls.common_name),
            "-days".to_string(),
            self.tls.days.to_string(),
            "-nodes".to_string(),
        ]);
        argv
    }

    async fn ensure_certificate(&self) -> Result<TlsMaterial> {
        let material = TlsMaterial {
            cert_path: self.layout.cert(),
            key_path: self.layout.cert_key(),
        };
        if material.cert_path.exists() && material.key_path.exists() {
            info!("🔑 证书已存在，跳过生成");
            return Ok(material);
        }

        info!("🔨 正在生成自签证书 (CN={})...", self.tls.common_name);
        let attempts: [(&str, &[&str]); 2] = [
            ("EC P-256", &["-newkey", "ec", "-pkeyopt", "ec_paramgen_curve:prime256v1"]),
            ("RSA-2048", &["-newkey", "rsa:2048"]),
        ];

        let mut failures = Vec::new();
        for (label, newkey) in attempts {
            let argv = self.openssl_argv(newkey);
            match self.runner.run(&argv).await {
                Ok(out) if out.success() => {
                    if material.cert_path.exists() && material.key_path.exists() {
                        restrict_permissions(&material.key_path).await?;
                        info!("✅ 已生成 {} 自签证书", label);
                        return Ok(material);
                    }
                    failures.push(format!("{}: 未生成证书文件", label));
                }
                Ok(out) => failures.push(format!("{}: 返回码 {}", label, out.exit_code)),
                Err(e) => failures.push(format!("{}: {}", label, e)),
            }
            warn!("⚠️ openssl {} 生成失败", label);
        }

        Err(secret_error(format!("自签证书生成失败 [{}]", failures.join("; "))))
    }
}
