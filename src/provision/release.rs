use std::fmt;

use crate::utils::{BootstrapError, Result};

/// 发行包的 CPU 架构分桶
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// 由 Rust 目标架构名映射，未知架构是致命错误
    pub fn from_target(target: &str) -> Result<Self> {
        match target {
            "x86_64" | "amd64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" => Ok(Arch::Arm64),
            other => Err(BootstrapError::Provisioning(format!("不支持的架构: {}", other))),
        }
    }

    pub fn detect() -> Result<Self> {
        Self::from_target(std::env::consts::ARCH)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// ELF e_machine 字段
    pub fn elf_machine(self) -> u16 {
        match self {
            Arch::Amd64 => 0x3e,
            Arch::Arm64 => 0xb7,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从 release 元数据中宽松提取 tag_name (不做完整 JSON 解析)
pub fn extract_tag_name(body: &str) -> Option<String> {
    let key = "\"tag_name\"";
    let rest = &body[body.find(key)? + key.len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let tag = &rest[..rest.find('"')?];
    let tag = tag.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

/// 发行包文件名，例如 sing-box-1.12.12-linux-amd64.tar.gz
pub fn archive_name(binary_name: &str, tag: &str, arch: Arch) -> String {
    let version = tag.strip_prefix('v').unwrap_or(tag);
    format!("{}-{}-linux-{}.tar.gz", binary_name, version, arch)
}

/// 主下载地址在前，镜像前缀按顺序拼接
pub fn download_urls(base: &str, mirrors: &[String], tag: &str, file: &str) -> Vec<String> {
    let primary = format!("{}/{}/{}", base.trim_end_matches('/'), tag, file);
    let mut urls = vec![primary.clone()];
    urls.extend(mirrors.iter().map(|prefix| format!("{}{}", prefix.trim(), primary)));
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_compact() {
        let body = r#"{"url":"x","tag_name":"v1.12.12","name":"sing-box"}"#;
        assert_eq!(extract_tag_name(body).as_deref(), Some("v1.12.12"));
    }

    #[test]
    fn test_extract_pretty() {
        let body = "{\n  \"tag_name\" :  \"v1.13.0-beta.1\",\n  \"draft\": false\n}";
        assert_eq!(extract_tag_name(body).as_deref(), Some("v1.13.0-beta.1"));
    }

    #[test]
    fn test_extract_missing() {
        assert_eq!(extract_tag_name(r#"{"message":"API rate limit exceeded"}"#), None);
        assert_eq!(extract_tag_name(r#"{"tag_name":""}"#), None);
        assert_eq!(extract_tag_name(r#"{"tag_name": 12}"#), None);
    }

    #[test]
    fn test_arch_mapping() {
        assert_eq!(Arch::from_target("x86_64").unwrap(), Arch::Amd64);
        assert_eq!(Arch::from_target("aarch64").unwrap(), Arch::Arm64);
        assert!(Arch::from_target("s390x").is_err());
    }

    #[test]
    fn test_urls() {
        let file = archive_name("sing-box", "v1.12.12", Arch::Arm64);
        assert_eq!(file, "sing-box-1.12.12-linux-arm64.tar.gz");
        let urls = download_urls(
            "https://github.com/SagerNet/sing-box/releases/download/",
            &["https://mirror.ghproxy.com/".to_string()],
            "v1.12.12",
            &file,
        );
        assert_eq!(
            urls,
            vec![
                "https://github.com/SagerNet/sing-box/releases/download/v1.12.12/sing-box-1.12.12-linux-arm64.tar.gz".to_string(),
                "https://mirror.ghproxy.com/https://github.com/SagerNet/sing-box/releases/download/v1.12.12/sing-box-1.12.12-linux-arm64.tar.gz".to_string(),
            ]
        );
    }
}
