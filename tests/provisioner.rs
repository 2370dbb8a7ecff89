mod common;

use std::sync::Arc;

use box_warden::config::{EngineConfig, Layout};
use box_warden::provision::{Arch, BinaryProvisioner};
use box_warden::BootstrapError;

use common::{elf_bytes, FakeFetcher, FakeRunner};

const API: &str = "https://api.example.test/releases/latest";
const PRIMARY: &str =
    "https://releases.example.test/download/v1.12.12/sing-box-1.12.12-linux-amd64.tar.gz";
const MIRROR: &str = "https://mirror.example.test/https://releases.example.test/download/v1.12.12/sing-box-1.12.12-linux-amd64.tar.gz";

fn engine() -> EngineConfig {
    EngineConfig {
        release_api: API.to_string(),
        download_base: "https://releases.example.test/download".to_string(),
        mirrors: vec!["https://mirror.example.test/".to_string()],
        min_archive_bytes: 1000,
        ..EngineConfig::default()
    }
}

fn provisioner(
    temp: &tempfile::TempDir,
    fetcher: Arc<FakeFetcher>,
    runner: Arc<FakeRunner>,
) -> (BinaryProvisioner, Layout) {
    let layout = Layout::new(common::work_dir(temp), "sing-box");
    (
        BinaryProvisioner::new(layout.clone(), engine(), Arch::Amd64, fetcher, runner),
        layout,
    )
}

#[tokio::test]
async fn test_truncated_primary_falls_through_to_mirror() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_text(API, "{\"tag_name\": \"v1.12.12\"}")
            .with_download(PRIMARY, b"<html>rate limited</html>".to_vec())
            .with_download(MIRROR, vec![0u8; 4096]),
    );
    let runner = Arc::new(FakeRunner::new().with_tar_payload(elf_bytes(Arch::Amd64)));
    let (provisioner, layout) = provisioner(&temp, fetcher.clone(), runner.clone());

    let binary = provisioner.ensure().await?;
    assert_eq!(binary.version, "v1.12.12");
    assert!(binary.validated);
    assert_eq!(binary.path, layout.binary());
    assert_eq!(fetcher.requested(), vec![API, PRIMARY, MIRROR]);
    // 太小的文件不会被解压
    assert_eq!(runner.count("tar"), 1);

    assert!(!layout.archive().exists());
    assert!(!layout.staging().exists());
    assert_eq!(
        std::fs::read_to_string(layout.version_file())?.trim(),
        "v1.12.12"
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(layout.binary())?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
    Ok(())
}

#[tokio::test]
async fn test_every_source_failing_is_fatal() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_text(API, "{\"tag_name\": \"v1.12.12\"}")
            .with_download(PRIMARY, vec![0u8; 10]),
    );
    let runner = Arc::new(FakeRunner::new().with_tar_payload(elf_bytes(Arch::Amd64)));
    let (provisioner, layout) = provisioner(&temp, fetcher, runner);

    let err = provisioner.ensure().await.unwrap_err();
    assert!(matches!(err, BootstrapError::Provisioning(_)));
    assert!(!layout.binary().exists());
    Ok(())
}

#[tokio::test]
async fn test_non_elf_payload_is_rejected() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_download(PRIMARY, vec![0u8; 4096])
            .with_download(MIRROR, vec![0u8; 4096]),
    );
    let runner = Arc::new(
        FakeRunner::new().with_tar_payload(b"#!/bin/sh\necho not really sing-box\n".to_vec()),
    );
    let (provisioner, layout) = provisioner(&temp, fetcher, runner.clone());

    let err = provisioner.ensure().await.unwrap_err();
    assert!(matches!(err, BootstrapError::Provisioning(_)));
    assert_eq!(runner.count("tar"), 2);
    assert!(!layout.binary().exists());
    Ok(())
}

#[tokio::test]
async fn test_lookup_failure_uses_fallback_version() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    // 版本查询没有预设响应，视为网络失败
    let fetcher = Arc::new(FakeFetcher::new().with_download(PRIMARY, vec![0u8; 4096]));
    let runner = Arc::new(FakeRunner::new().with_tar_payload(elf_bytes(Arch::Amd64)));
    let (provisioner, _) = provisioner(&temp, fetcher.clone(), runner);

    let binary = provisioner.ensure().await?;
    assert_eq!(binary.version, "v1.12.12");
    assert_eq!(fetcher.requested(), vec![API, PRIMARY]);
    Ok(())
}

#[tokio::test]
async fn test_existing_binary_needs_no_network() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_text(API, "{\"tag_name\": \"v1.12.12\"}")
            .with_download(PRIMARY, vec![0u8; 4096]),
    );
    let runner = Arc::new(FakeRunner::new().with_tar_payload(elf_bytes(Arch::Amd64)));
    let (provisioner, _) = provisioner(&temp, fetcher.clone(), runner.clone());

    let first = provisioner.ensure().await?;
    let calls = fetcher.calls();
    let second = provisioner.ensure().await?;
    assert_eq!(first, second);
    assert_eq!(fetcher.calls(), calls);
    assert_eq!(runner.count("tar"), 1);
    Ok(())
}

#[tokio::test]
async fn test_wrong_arch_binary_is_replaced() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_text(API, "{\"tag_name\": \"v1.12.12\"}")
            .with_download(PRIMARY, vec![0u8; 4096]),
    );
    let runner = Arc::new(FakeRunner::new().with_tar_payload(elf_bytes(Arch::Amd64)));
    let (provisioner, layout) = provisioner(&temp, fetcher.clone(), runner);

    std::fs::create_dir_all(layout.root())?;
    std::fs::write(layout.binary(), elf_bytes(Arch::Arm64))?;

    provisioner.ensure().await?;
    assert_eq!(std::fs::read(layout.binary())?, elf_bytes(Arch::Amd64));
    assert_eq!(fetcher.calls(), 2);
    Ok(())
}
