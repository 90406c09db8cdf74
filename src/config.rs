// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process configuration, read from environment variables.
//!
//! Grounded on `azure_iot_operations_connector`'s `string_from_environment` helper:
//! a required variable that's absent or non-Unicode is an error, everything else
//! gets parsed with a specific, named failure mode rather than a generic one.

use std::env::{self, VarError};
use std::time::Duration;

use derive_builder::Builder;
use thiserror::Error;

use crate::cloud::ACK_TIMEOUT;
use crate::mode::ConfiguredMode;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] pub(crate) ConfigErrorKind);

#[derive(Debug, Error)]
pub enum ConfigErrorKind {
    #[error("required environment variable missing: {0}")]
    EnvVarMissing(String),
    #[error("environment variable {0} is not valid unicode")]
    EnvVarNotUnicode(String),
    #[error("environment variable {0} has an invalid value: {1:?}")]
    EnvVarMalformed(String, String),
}

/// Fully resolved process configuration.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub configured_mode: ConfiguredMode,
    #[builder(default = "1")]
    pub hybrid_fail_threshold: u32,
    #[builder(default = "Duration::from_secs(60)")]
    pub hybrid_retry_interval: Duration,
    #[builder(default = "Duration::from_secs(5)")]
    pub hybrid_connect_timeout: Duration,
    #[builder(default = "None")]
    pub device_id: Option<String>,
}

impl ProxyConfig {
    /// Read configuration from the process environment.
    ///
    /// `cloud_ack_timeout_s` is accepted (so deployments that set it don't fail to
    /// start) but its value is discarded in favor of the fixed [`ACK_TIMEOUT`]; a
    /// warning is logged if it is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if string_from_environment("CLOUD_ACK_TIMEOUT_S")?.is_some() {
            log::warn!(
                "CLOUD_ACK_TIMEOUT_S is set but ignored; the ack timeout is fixed at {:?}",
                ACK_TIMEOUT
            );
        }

        let mut builder = ProxyConfigBuilder::default();
        builder
            .listen_host(required_string("PROXY_LISTEN_HOST")?)
            .listen_port(required_u16("PROXY_LISTEN_PORT")?)
            .target_host(required_string("TARGET_SERVER")?)
            .target_port(required_u16("TARGET_PORT")?)
            .configured_mode(required_mode("PROXY_MODE")?);

        if let Some(raw) = string_from_environment("HYBRID_FAIL_THRESHOLD")? {
            builder.hybrid_fail_threshold(parse_u32("HYBRID_FAIL_THRESHOLD", &raw)?);
        }
        if let Some(raw) = string_from_environment("HYBRID_RETRY_INTERVAL_S")? {
            builder.hybrid_retry_interval(Duration::from_secs(u64::from(parse_u32(
                "HYBRID_RETRY_INTERVAL_S",
                &raw,
            )?)));
        }
        if let Some(raw) = string_from_environment("HYBRID_CONNECT_TIMEOUT_S")? {
            builder.hybrid_connect_timeout(Duration::from_secs(u64::from(parse_u32(
                "HYBRID_CONNECT_TIMEOUT_S",
                &raw,
            )?)));
        }
        if let Some(device_id) = string_from_environment("DEVICE_ID")? {
            builder.device_id(Some(device_id));
        }

        builder.build().map_err(|e| {
            ConfigErrorKind::EnvVarMalformed("<config>".to_string(), e.to_string()).into()
        })
    }
}

fn string_from_environment(key: &str) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            Err(ConfigErrorKind::EnvVarNotUnicode(key.to_string()).into())
        }
    }
}

fn required_string(key: &str) -> Result<String, ConfigError> {
    string_from_environment(key)?.ok_or_else(|| ConfigErrorKind::EnvVarMissing(key.to_string()).into())
}

fn required_u16(key: &str) -> Result<u16, ConfigError> {
    let raw = required_string(key)?;
    raw.parse()
        .map_err(|_| ConfigErrorKind::EnvVarMalformed(key.to_string(), raw).into())
}

fn parse_u32(key: &str, raw: &str) -> Result<u32, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigErrorKind::EnvVarMalformed(key.to_string(), raw.to_string()).into())
}

fn required_mode(key: &str) -> Result<ConfiguredMode, ConfigError> {
    let raw = required_string(key)?;
    ConfiguredMode::parse(&raw)
        .ok_or_else(|| ConfigErrorKind::EnvVarMalformed(key.to_string(), raw).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests can't run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "PROXY_LISTEN_HOST",
            "PROXY_LISTEN_PORT",
            "TARGET_SERVER",
            "TARGET_PORT",
            "PROXY_MODE",
            "HYBRID_FAIL_THRESHOLD",
            "HYBRID_RETRY_INTERVAL_S",
            "HYBRID_CONNECT_TIMEOUT_S",
            "CLOUD_ACK_TIMEOUT_S",
            "DEVICE_ID",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_variable_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err.0, ConfigErrorKind::EnvVarMissing(_)));
    }

    #[test]
    fn full_environment_resolves_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("PROXY_LISTEN_HOST", "0.0.0.0");
        env::set_var("PROXY_LISTEN_PORT", "4000");
        env::set_var("TARGET_SERVER", "oigservis.example");
        env::set_var("TARGET_PORT", "4001");
        env::set_var("PROXY_MODE", "hybrid");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.listen_port, 4000);
        assert_eq!(config.configured_mode, ConfiguredMode::Hybrid);
        assert_eq!(config.hybrid_fail_threshold, 1);
        assert_eq!(config.hybrid_retry_interval, Duration::from_secs(60));
        clear_all();
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("PROXY_LISTEN_HOST", "0.0.0.0");
        env::set_var("PROXY_LISTEN_PORT", "4000");
        env::set_var("TARGET_SERVER", "oigservis.example");
        env::set_var("TARGET_PORT", "4001");
        env::set_var("PROXY_MODE", "sideways");

        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err.0, ConfigErrorKind::EnvVarMalformed(_, _)));
        clear_all();
    }

    #[test]
    fn ack_timeout_override_is_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("PROXY_LISTEN_HOST", "0.0.0.0");
        env::set_var("PROXY_LISTEN_PORT", "4000");
        env::set_var("TARGET_SERVER", "oigservis.example");
        env::set_var("TARGET_PORT", "4001");
        env::set_var("PROXY_MODE", "online");
        env::set_var("CLOUD_ACK_TIMEOUT_S", "30");

        // Accepted, not rejected, and has no field to land in.
        assert!(ProxyConfig::from_env().is_ok());
        clear_all();
    }
}
