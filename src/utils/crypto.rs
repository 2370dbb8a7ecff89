use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::{BootstrapError, Result};

/// Short ID 的字节长度 (hex 编码后 16 个字符)
const SHORT_ID_BYTES: usize = 8;

/// 解码 32 字节 X25519 密钥
///
/// sing-box 输出 URL-safe 无填充格式，这里同时接受标准 Base64。
fn decode_key(s: &str) -> Option<[u8; 32]> {
    let s = s.trim();
    let engines = [
        &general_purpose::URL_SAFE_NO_PAD,
        &general_purpose::URL_SAFE,
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
    ];
    for engine in engines {
        if let Ok(bytes) = engine.decode(s) {
            if let Ok(array) = <[u8; 32]>::try_from(bytes.as_slice()) {
                return Some(array);
            }
        }
    }
    None
}

/// 校验 Reality 密钥对：私钥必须可解码，且其公钥与给定公钥一致
pub fn verify_reality_keypair(private_key: &str, public_key: &str) -> Result<()> {
    let private_bytes = decode_key(private_key).ok_or_else(|| {
        BootstrapError::SecretGeneration("Reality 私钥不是 32 字节的 Base64".to_string())
    })?;
    let public_bytes = decode_key(public_key).ok_or_else(|| {
        BootstrapError::SecretGeneration("Reality 公钥不是 32 字节的 Base64".to_string())
    })?;

    let derived = PublicKey::from(&StaticSecret::from(private_bytes));
    if derived.as_bytes() != &public_bytes {
        return Err(BootstrapError::SecretGeneration(
            "Reality 公钥与私钥不匹配".to_string(),
        ));
    }
    Ok(())
}

/// 生成随机 Short ID
pub fn generate_short_id() -> String {
    let mut bytes = [0u8; SHORT_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
