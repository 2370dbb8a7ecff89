mod common;

use std::path::PathBuf;
use std::sync::Arc;

use box_warden::config::{Identity, Layout, TlsConfig};
use box_warden::secrets::SecretStore;
use box_warden::BootstrapError;
use uuid::Uuid;

use common::{keypair, FakeRunner};

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn fixed() -> Identity {
    Identity::Fixed(Uuid::parse_str(UUID).unwrap())
}

fn open_store(temp: &tempfile::TempDir, runner: Arc<FakeRunner>) -> (SecretStore, Layout) {
    let layout = Layout::new(common::work_dir(temp), "sing-box");
    (
        SecretStore::new(layout.clone(), runner, TlsConfig::default()),
        layout,
    )
}

fn binary(layout: &Layout) -> PathBuf {
    layout.binary()
}

#[tokio::test]
async fn test_second_load_touches_nothing() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new());
    let (store, layout) = open_store(&temp, runner.clone());

    let first = store.load_or_create(fixed(), &binary(&layout)).await?;
    let calls_after_first = runner.calls().len();
    assert_eq!(runner.keygen_count(), 1);
    assert_eq!(runner.count("openssl"), 1);

    let second = store.load_or_create(fixed(), &binary(&layout)).await?;
    assert_eq!(first, second);
    assert_eq!(runner.calls().len(), calls_after_first);

    let (private_key, public_key) = keypair(7);
    assert_eq!(second.reality.private_key, private_key);
    assert_eq!(second.reality.public_key, public_key);
    assert_eq!(second.reality.short_id.len(), 16);
    assert!(second.tls.cert_path.exists());
    Ok(())
}

#[tokio::test]
async fn test_persisted_file_round_trips() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new());
    let (store, layout) = open_store(&temp, runner.clone());

    let bundle = store.load_or_create(fixed(), &binary(&layout)).await?;

    // 新的实例只读取文件
    let fresh_runner = Arc::new(FakeRunner::new().with_keygen_output(None));
    let (reloaded_store, _) = open_store(&temp, fresh_runner.clone());
    let reloaded = reloaded_store.load_or_create(fixed(), &binary(&layout)).await?;
    assert_eq!(bundle, reloaded);
    assert!(fresh_runner.calls().is_empty());

    let text = std::fs::read_to_string(layout.reality_key())?;
    assert!(text.contains(&format!("ShortId: {}", bundle.reality.short_id)));
    Ok(())
}

#[tokio::test]
async fn test_missing_public_key_fails_fast() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let (private_key, _) = keypair(3);
    let output = format!("PrivateKey: {}\n", private_key);
    let runner = Arc::new(FakeRunner::new().with_keygen_output(Some(&output)));
    let (store, layout) = open_store(&temp, runner);

    let err = store
        .load_or_create(fixed(), &binary(&layout))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SecretGeneration(_)));
    assert!(!layout.reality_key().exists());
    Ok(())
}

#[tokio::test]
async fn test_keygen_failure_is_fatal() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new().with_keygen_output(None));
    let (store, layout) = open_store(&temp, runner);

    let err = store
        .load_or_create(fixed(), &binary(&layout))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SecretGeneration(_)));
    Ok(())
}

#[tokio::test]
async fn test_mismatched_persisted_keys_are_not_replaced() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new());
    let (store, layout) = open_store(&temp, runner.clone());

    std::fs::create_dir_all(layout.root())?;
    let (private_key, _) = keypair(1);
    let (_, other_public) = keypair(2);
    let corrupt = format!(
        "PrivateKey: {}\nPublicKey: {}\nShortId: abcd\n",
        private_key, other_public
    );
    std::fs::write(layout.reality_key(), &corrupt)?;

    let err = store
        .load_or_create(fixed(), &binary(&layout))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SecretGeneration(_)));
    assert_eq!(std::fs::read_to_string(layout.reality_key())?, corrupt);
    assert_eq!(runner.keygen_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_certificate_falls_back_to_rsa() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new().failing_openssl("ec_paramgen_curve"));
    let (store, layout) = open_store(&temp, runner.clone());

    let bundle = store.load_or_create(fixed(), &binary(&layout)).await?;
    assert_eq!(runner.count("openssl"), 2);
    assert!(bundle.tls.cert_path.exists());
    assert!(bundle.tls.key_path.exists());

    let last = runner
        .calls()
        .into_iter()
        .filter(|argv| argv[0] == "openssl")
        .last()
        .unwrap();
    assert!(last.contains(&"rsa:2048".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_certificate_failure_is_fatal() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(
        FakeRunner::new()
            .failing_openssl("ec_paramgen_curve")
            .failing_openssl("rsa:2048"),
    );
    let (store, layout) = open_store(&temp, runner);

    let err = store
        .load_or_create(fixed(), &binary(&layout))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SecretGeneration(_)));
    Ok(())
}

#[tokio::test]
async fn test_auto_identity_is_persisted() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new());
    let (store, layout) = open_store(&temp, runner);

    let first = store.load_or_create(Identity::Auto, &binary(&layout)).await?;
    let second = store.load_or_create(Identity::Auto, &binary(&layout)).await?;
    assert_eq!(first.uuid, second.uuid);
    assert_eq!(
        std::fs::read_to_string(layout.uuid_file())?.trim(),
        first.uuid.to_string()
    );
    Ok(())
}

#[tokio::test]
async fn test_rotate_regenerates_keys_and_keeps_identity() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let runner = Arc::new(FakeRunner::new());
    let (store, layout) = open_store(&temp, runner.clone());

    let before = store.load_or_create(Identity::Auto, &binary(&layout)).await?;
    let after = store.rotate(Identity::Auto, &binary(&layout)).await?;

    assert_eq!(runner.keygen_count(), 2);
    assert_eq!(runner.count("openssl"), 2);
    assert_eq!(before.uuid, after.uuid);
    assert_ne!(before.reality.short_id, after.reality.short_id);
    Ok(())
}
