use super::{AppConfig, DesiredState};
use crate::scheduler::{parse_restart_time, parse_utc_offset};
use crate::utils::{BootstrapError, Result};

pub struct Validator;

fn invalid(msg: impl Into<String>) -> BootstrapError {
    BootstrapError::Configuration(msg.into())
}

impl Validator {
    /// 验证配置的有效性
    pub fn validate(config: &AppConfig) -> Result<()> {
        // 身份与端口
        DesiredState::from_config(config)?;

        // 验证 SNI
        let sni = config.sni.trim();
        if sni.is_empty() || sni.contains(char::is_whitespace) {
            return Err(invalid(format!("sni 无效: {:?}", config.sni)));
        }

        if !config.xhttp_path.starts_with('/') {
            return Err(invalid(format!("xhttp_path 必须以 / 开头: {}", config.xhttp_path)));
        }

        Self::validate_engine(config)?;

        // 验证重启计划
        if config.restart.enabled {
            parse_restart_time(&config.restart.at)?;
            parse_utc_offset(&config.restart.utc_offset)?;
        }

        if config.supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms 不能为 0"));
        }

        Ok(())
    }

    fn validate_engine(config: &AppConfig) -> Result<()> {
        let engine = &config.engine;

        let name = engine.binary_name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(invalid(format!("engine.binary_name 无效: {:?}", engine.binary_name)));
        }

        if engine.fallback_version.trim().is_empty() {
            return Err(invalid("engine.fallback_version 不能为空"));
        }

        if engine.min_archive_bytes == 0 {
            return Err(invalid("engine.min_archive_bytes 不能为 0"));
        }

        if engine.mirrors.iter().any(|m| m.trim().is_empty()) {
            return Err(invalid("engine.mirrors 中存在空项"));
        }

        if engine.lookup_timeout_secs == 0 || engine.download_timeout_secs == 0 {
            return Err(invalid("engine 超时必须大于 0"));
        }

        Ok(())
    }
}
