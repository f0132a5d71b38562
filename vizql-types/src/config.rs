//! Typed configuration tree covering every knob the engine needs at
//! runtime.
//!
//! A single YAML-deserializable config struct with `serde(default)` per
//! field, exercised by `tests/config_yaml_deserialize.rs`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_preview_ttl_secs() -> u64 {
    300
}

fn default_preview_row_limit() -> u64 {
    100
}

fn default_preview_max_execution_time_s() -> u64 {
    3
}

fn default_preview_max_memory_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_preview_max_rows_to_read() -> u64 {
    10_000_000
}

fn default_widget_max_execution_time_s() -> u64 {
    30
}

fn default_widget_max_memory_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_widget_max_rows_to_read() -> u64 {
    50_000_000
}

fn default_max_offset() -> u64 {
    10_000
}

fn default_page_size() -> u64 {
    50
}

fn default_heartbeat_interval_s() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    #[serde(rename = "ttl_secs")]
    pub ttl_secs: u64,
    pub row_limit: u64,
    pub max_execution_time_s: u64,
    pub max_memory_bytes: u64,
    pub max_rows_to_read: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_preview_ttl_secs(),
            row_limit: default_preview_row_limit(),
            max_execution_time_s: default_preview_max_execution_time_s(),
            max_memory_bytes: default_preview_max_memory_bytes(),
            max_rows_to_read: default_preview_max_rows_to_read(),
        }
    }
}

impl PreviewConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    pub max_execution_time_s: u64,
    pub max_memory_bytes: u64,
    pub max_rows_to_read: u64,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            max_execution_time_s: default_widget_max_execution_time_s(),
            max_memory_bytes: default_widget_max_memory_bytes(),
            max_rows_to_read: default_widget_max_rows_to_read(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub max_offset: u64,
    pub default_page_size: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_offset: default_max_offset(),
            default_page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub scan_limit: u32,
    pub pipeline_batch: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            scan_limit: 10_000,
            pipeline_batch: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Whether to serve a cache entry past its TTL when the backing store
    /// is unavailable. Default off.
    pub serve_stale_on_store_unavailable: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            serve_stale_on_store_unavailable: false,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEndpoints {
    pub olap_http_url: String,
    pub stream_pg_url: String,
    pub kv_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentConfig {
    pub enabled: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// Secrets that must never carry an insecure development default once
/// `development.enabled = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub bearer_signing_key: String,
    pub kv_auth_token: Option<String>,
}

const INSECURE_DEV_SIGNING_KEY: &str = "dev-insecure-signing-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VizqlConfig {
    pub preview: PreviewConfig,
    pub widget: WidgetConfig,
    pub pagination: PaginationConfig,
    pub kv: KvConfig,
    pub cache: CacheConfig,
    pub stores: StoreEndpoints,
    pub development: DevelopmentConfig,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    pub secrets: SecretsConfig,
}

impl Default for StoreEndpoints {
    fn default() -> Self {
        Self {
            olap_http_url: "http://localhost:8123".to_string(),
            stream_pg_url: "postgres://localhost:5432/streamdb".to_string(),
            kv_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            bearer_signing_key: INSECURE_DEV_SIGNING_KEY.to_string(),
            kv_auth_token: None,
        }
    }
}

impl Default for VizqlConfig {
    fn default() -> Self {
        Self {
            preview: PreviewConfig::default(),
            widget: WidgetConfig::default(),
            pagination: PaginationConfig::default(),
            kv: KvConfig::default(),
            cache: CacheConfig::default(),
            stores: StoreEndpoints::default(),
            development: DevelopmentConfig::default(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            secrets: SecretsConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to start: {0} carries an insecure development default but development mode is disabled")]
    InsecureSecretInProduction(&'static str),
}

impl VizqlConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: VizqlConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// A critical secret must not carry its development default once
    /// development mode is off.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.development.enabled && self.secrets.bearer_signing_key == INSECURE_DEV_SIGNING_KEY
        {
            return Err(ConfigError::InsecureSecretInProduction(
                "secrets.bearer_signing_key",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = VizqlConfig::default();
        assert_eq!(cfg.preview.row_limit, 100);
        assert_eq!(cfg.preview.max_execution_time_s, 3);
        assert_eq!(cfg.preview.max_memory_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.preview.max_rows_to_read, 10_000_000);
        assert_eq!(cfg.widget.max_execution_time_s, 30);
        assert_eq!(cfg.widget.max_memory_bytes, 500 * 1024 * 1024);
        assert_eq!(cfg.widget.max_rows_to_read, 50_000_000);
        assert_eq!(cfg.pagination.max_offset, 10_000);
        assert_eq!(cfg.pagination.default_page_size, 50);
        assert_eq!(cfg.cache.ttl_secs, 300);
        assert_eq!(cfg.heartbeat_interval_s, 30);
    }

    #[test]
    fn rejects_dev_secret_in_production() {
        let cfg = VizqlConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allows_dev_secret_when_development_mode_enabled() {
        let mut cfg = VizqlConfig::default();
        cfg.development.enabled = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let yaml = r#"
preview:
  row_limit: 25
development:
  enabled: true
secrets:
  bearer_signing_key: "prod-key-from-vault"
"#;
        let cfg = VizqlConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.preview.row_limit, 25);
        assert_eq!(cfg.preview.max_execution_time_s, 3);
        assert_eq!(cfg.widget.max_execution_time_s, 30);
    }
}
