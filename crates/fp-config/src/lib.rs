// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the function platform.
//!
//! This crate provides [`PlatformConfig`] — the top-level runtime settings
//! listed in the platform contract's Configuration section — together with
//! helpers for loading from TOML files, layering environment overrides
//! (via `fp-config-env`), and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// An environment override could not be parsed.
    #[error("environment override invalid: {0}")]
    EnvOverride(#[from] fp_config_env::EnvParseError),

    /// Two configs could not be merged because of conflicting constraints.
    #[error("merge conflict: {reason}")]
    MergeConflict {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A configured value is unusually large and may indicate a mistake.
    UnusuallyLargeValue {
        /// Field name.
        field: String,
        /// The value, rendered for display.
        value: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::UnusuallyLargeValue { field, value } => {
                write!(f, "field '{field}' has an unusually large value ({value})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the function platform (§6).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PlatformConfig {
    /// Per-invocation wall-clock deadline, in milliseconds (§5).
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Hard ceiling on concurrently acquired isolates (§4.2, §5).
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Isolates kept warm with bootstrap code pre-loaded (§4.2).
    #[serde(default = "default_min_pool")]
    pub min_pool: usize,
    /// Package cache size cap in gigabytes (§4.1).
    #[serde(default = "default_max_cache_size_gb")]
    pub max_cache_size_gb: u64,
    /// Package cache entry max age in days (§4.1).
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u64,
    /// Root directory for unpacked package cache entries.
    pub cache_dir: String,
    /// Invalidation debounce window, in milliseconds (§4.3).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Connection string for the metadata store (C1).
    pub metadata_database_url: String,
    /// Connection string / endpoint for the object store (C2).
    pub object_store_url: String,
    /// Object store bucket holding function packages.
    #[serde(default = "default_object_store_bucket")]
    pub object_store_bucket: String,
    /// `gateway_invalidated` channel name (§4.3).
    #[serde(default = "default_gateway_channel")]
    pub gateway_invalidation_channel: String,
    /// `execution_cache_invalidated` channel name (§4.3).
    #[serde(default = "default_execution_channel")]
    pub execution_invalidation_channel: String,
    /// Retries for transient package-fetch faults before surfacing `502` (§7).
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,
    /// Global execution-log retention window in days, used for any
    /// function with no per-function `retention` override (§3: "per-function
    /// override of a global default").
    #[serde(default = "default_retention_days")]
    pub default_retention_days: u32,
}

fn default_execution_timeout_ms() -> u64 {
    10_000
}
fn default_max_pool_size() -> usize {
    64
}
fn default_min_pool() -> usize {
    4
}
fn default_max_cache_size_gb() -> u64 {
    10
}
fn default_cache_ttl_days() -> u64 {
    7
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_object_store_bucket() -> String {
    "function-packages".into()
}
fn default_gateway_channel() -> String {
    "gateway_invalidated".into()
}
fn default_execution_channel() -> String {
    "execution_cache_invalidated".into()
}
fn default_max_fetch_retries() -> u32 {
    3
}
fn default_retention_days() -> u32 {
    30
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout_ms(),
            max_pool_size: default_max_pool_size(),
            min_pool: default_min_pool(),
            max_cache_size_gb: default_max_cache_size_gb(),
            cache_ttl_days: default_cache_ttl_days(),
            cache_dir: "/var/lib/fp/cache".into(),
            debounce_ms: default_debounce_ms(),
            metadata_database_url: "postgres://localhost/fp".into(),
            object_store_url: "http://localhost:9000".into(),
            object_store_bucket: default_object_store_bucket(),
            gateway_invalidation_channel: default_gateway_channel(),
            execution_invalidation_channel: default_execution_channel(),
            max_fetch_retries: default_max_fetch_retries(),
            default_retention_days: default_retention_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_REASONABLE_TIMEOUT_MS: u64 = 15 * 60 * 1000;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`PlatformConfig`] from an optional TOML file path, then apply
/// environment overrides on top.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, starts from [`PlatformConfig::default()`].
pub fn load_config(path: Option<&Path>) -> Result<PlatformConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => PlatformConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into a [`PlatformConfig`].
pub fn parse_toml(content: &str) -> Result<PlatformConfig, ConfigError> {
    toml::from_str::<PlatformConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides on top of a parsed configuration.
///
/// Recognised variables: `EXECUTION_TIMEOUT_MS`, `MAX_POOL_SIZE`,
/// `MIN_POOL`, `MAX_CACHE_SIZE_GB`, `CACHE_TTL_DAYS`, `CACHE_DIR`,
/// `DEBOUNCE_MS`, `METADATA_DATABASE_URL`, `OBJECT_STORE_URL`,
/// `OBJECT_STORE_BUCKET`, `MAX_FETCH_RETRIES`, `DEFAULT_RETENTION_DAYS`.
pub fn apply_env_overrides(config: &mut PlatformConfig) -> Result<(), ConfigError> {
    if let Some(v) = fp_config_env::read_parsed::<u64>("EXECUTION_TIMEOUT_MS")? {
        config.execution_timeout_ms = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<usize>("MAX_POOL_SIZE")? {
        config.max_pool_size = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<usize>("MIN_POOL")? {
        config.min_pool = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<u64>("MAX_CACHE_SIZE_GB")? {
        config.max_cache_size_gb = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<u64>("CACHE_TTL_DAYS")? {
        config.cache_ttl_days = v;
    }
    if let Some(v) = fp_config_env::read_string("CACHE_DIR")? {
        config.cache_dir = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<u64>("DEBOUNCE_MS")? {
        config.debounce_ms = v;
    }
    if let Some(v) = fp_config_env::read_string("METADATA_DATABASE_URL")? {
        config.metadata_database_url = v;
    }
    if let Some(v) = fp_config_env::read_string("OBJECT_STORE_URL")? {
        config.object_store_url = v;
    }
    if let Some(v) = fp_config_env::read_string("OBJECT_STORE_BUCKET")? {
        config.object_store_bucket = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<u32>("MAX_FETCH_RETRIES")? {
        config.max_fetch_retries = v;
    }
    if let Some(v) = fp_config_env::read_parsed::<u32>("DEFAULT_RETENTION_DAYS")? {
        config.default_retention_days = v;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero pool size, `min_pool > max_pool_size`, empty
/// connection strings) are returned as a [`ConfigError::ValidationError`];
/// soft issues come back as warnings.
pub fn validate_config(config: &PlatformConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.max_pool_size == 0 {
        errors.push("max_pool_size must be greater than zero".into());
    }
    if config.min_pool > config.max_pool_size {
        errors.push(format!(
            "min_pool ({}) must not exceed max_pool_size ({})",
            config.min_pool, config.max_pool_size
        ));
    }
    if config.metadata_database_url.trim().is_empty() {
        errors.push("metadata_database_url must not be empty".into());
    }
    if config.object_store_url.trim().is_empty() {
        errors.push("object_store_url must not be empty".into());
    }
    if config.cache_dir.trim().is_empty() {
        errors.push("cache_dir must not be empty".into());
    }
    if config.execution_timeout_ms == 0 {
        errors.push("execution_timeout_ms must be greater than zero".into());
    } else if config.execution_timeout_ms > MAX_REASONABLE_TIMEOUT_MS {
        warnings.push(ConfigWarning::UnusuallyLargeValue {
            field: "execution_timeout_ms".into(),
            value: config.execution_timeout_ms.to_string(),
        });
    }
    if config.gateway_invalidation_channel == config.execution_invalidation_channel {
        errors.push("gateway_invalidation_channel and execution_invalidation_channel must differ".into());
    }
    if config.max_cache_size_gb == 0 {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "max_cache_size_gb".into(),
            hint: "a zero-size cache evicts everything immediately".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Non-default scalar values in `overlay` take
/// precedence over `base`; this is a full field-for-field overlay since
/// every field in [`PlatformConfig`] is required (unlike the optional
/// fields of earlier drafts), so merging simply prefers `overlay` wholesale
/// while keeping the signature for symmetry with `fp-config-env` layering.
pub fn merge_configs(_base: PlatformConfig, overlay: PlatformConfig) -> PlatformConfig {
    overlay
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = PlatformConfig::default();
        validate_config(&cfg).expect("default config should be valid");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = PlatformConfig::default();
        assert_eq!(cfg.execution_timeout_ms, 10_000);
        assert_eq!(cfg.min_pool, 4);
        assert_eq!(cfg.max_pool_size, 64);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            cache_dir = "/tmp/cache"
            metadata_database_url = "postgres://db/fp"
            object_store_url = "https://s3.example.com"
            min_pool = 2
            max_pool_size = 8
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.cache_dir, "/tmp/cache");
        assert_eq!(cfg.min_pool, 2);
        assert_eq!(cfg.max_pool_size, 8);
        // defaults still applied
        assert_eq!(cfg.debounce_ms, 200);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_required_field_gives_parse_error() {
        let toml_str = r#"min_pool = 1"#;
        let err = parse_toml(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_min_pool_exceeding_max() {
        let mut cfg = PlatformConfig::default();
        cfg.min_pool = 100;
        cfg.max_pool_size = 10;
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("min_pool")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_zero_pool_size() {
        let mut cfg = PlatformConfig::default();
        cfg.max_pool_size = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_catches_identical_invalidation_channels() {
        let mut cfg = PlatformConfig::default();
        cfg.execution_invalidation_channel = cfg.gateway_invalidation_channel.clone();
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("must differ")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn large_timeout_produces_warning() {
        let mut cfg = PlatformConfig::default();
        cfg.execution_timeout_ms = MAX_REASONABLE_TIMEOUT_MS + 1;
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::UnusuallyLargeValue { .. }))
        );
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = PlatformConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: PlatformConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "cache_dir = \"/tmp/c\"\nmetadata_database_url = \"postgres://x\"\nobject_store_url = \"https://y\""
        )
        .unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.cache_dir, "/tmp/c");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/platform.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    #[serial]
    fn env_override_applies_on_top_of_file() {
        std::env::set_var("MIN_POOL", "7");
        let mut cfg = PlatformConfig::default();
        apply_env_overrides(&mut cfg).unwrap();
        assert_eq!(cfg.min_pool, 7);
        std::env::remove_var("MIN_POOL");
    }

    #[test]
    #[serial]
    fn env_override_applies_default_retention_days() {
        std::env::set_var("DEFAULT_RETENTION_DAYS", "14");
        let mut cfg = PlatformConfig::default();
        apply_env_overrides(&mut cfg).unwrap();
        assert_eq!(cfg.default_retention_days, 14);
        std::env::remove_var("DEFAULT_RETENTION_DAYS");
    }

    #[test]
    fn default_retention_days_is_thirty() {
        assert_eq!(PlatformConfig::default().default_retention_days, 30);
    }

    #[test]
    fn merge_overlay_wins_wholesale() {
        let base = PlatformConfig::default();
        let mut overlay = PlatformConfig::default();
        overlay.min_pool = 99;
        let merged = merge_configs(base, overlay.clone());
        assert_eq!(merged.min_pool, 99);
    }
}
