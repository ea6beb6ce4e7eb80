//! Multi-tier TOML configuration for Cachet.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use cachet_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The default remote store endpoint.
pub const DEFAULT_ENDPOINT: &str = "redis://127.0.0.1:6379";

/// The default application name used as key prefix.
pub const DEFAULT_APPLICATION_NAME: &str = "cachet";

/// The default wall-clock budget for retrying transient store faults.
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 5000;

/// The default session codec.
pub const DEFAULT_CODEC: &str = "tlv";

/// How long a write lock lives before the store reclaims it.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u32 = 110;

/// Idle expiry of a session record.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 1200;

/// Endpoint schemes the client knows how to connect to.
pub const SUPPORTED_SCHEMES: [&str; 2] = ["redis://", "memory://"];

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct CachetConfig {
    pub application_name: String,
    pub endpoints: Vec<String>,
    pub retry_timeout: Duration,
    pub codec: String,
    pub allowed_types: Vec<String>,
    pub allow_non_atomic_locks: bool,
    pub lock_timeout_secs: u32,
    pub session_timeout_secs: u32,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

/// `[store]` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    pub application_name: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub retry_timeout_ms: Option<u64>,
    /// Permit the sequential (non-atomic) lock protocol when the store
    /// cannot run scripts.
    #[serde(default)]
    pub allow_non_atomic_locks: bool,
}

/// `[session]` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub codec: Option<String>,
    #[serde(default)]
    pub allowed_types: Vec<String>,
    pub lock_timeout_secs: Option<u32>,
    pub timeout_secs: Option<u32>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub application_name: Option<String>,
    pub endpoint: Option<String>,
    pub codec: Option<String>,
    pub config_file: Option<PathBuf>,
}

impl CachetConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (`--config`, or `~/.cachet/config.toml`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let path = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| config_dir.join("config.toml"));
        let settings = load_settings_file(&path);
        resolve(settings, overrides, |key| std::env::var(key).ok(), config_dir)
    }
}

/// Merge the sources. `env` looks up an environment variable.
pub fn resolve(
    settings: SettingsFile,
    overrides: CliOverrides,
    env: impl Fn(&str) -> Option<String>,
    config_dir: PathBuf,
) -> Result<CachetConfig, ConfigError> {
    let application_name = overrides
        .application_name
        .or_else(|| env("CACHET_APPLICATION_NAME"))
        .or(settings.store.application_name)
        .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string());
    cachet_types::validate_application_name(&application_name)?;

    // A single endpoint from CLI, a comma-separated list from env
    let endpoints = match overrides.endpoint {
        Some(endpoint) => vec![endpoint],
        None => match env("CACHET_ENDPOINT") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None if !settings.store.endpoints.is_empty() => settings.store.endpoints,
            None => vec![DEFAULT_ENDPOINT.to_string()],
        },
    };
    validate_endpoints(&endpoints)?;

    let retry_timeout_ms = match env("CACHET_RETRY_TIMEOUT_MS") {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "CACHET_RETRY_TIMEOUT_MS".into(),
                message: e.to_string(),
            })?,
        None => settings
            .store
            .retry_timeout_ms
            .unwrap_or(DEFAULT_RETRY_TIMEOUT_MS),
    };

    let codec = overrides
        .codec
        .or_else(|| env("CACHET_CODEC"))
        .or(settings.session.codec)
        .unwrap_or_else(|| DEFAULT_CODEC.to_string());

    let lock_timeout_secs = settings
        .session
        .lock_timeout_secs
        .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS);
    let session_timeout_secs = settings
        .session
        .timeout_secs
        .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
    for (key, value) in [
        ("session.lock_timeout_secs", lock_timeout_secs),
        ("session.timeout_secs", session_timeout_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.into(),
                message: "must be at least 1 second".into(),
            });
        }
    }

    Ok(CachetConfig {
        application_name,
        endpoints,
        retry_timeout: Duration::from_millis(retry_timeout_ms),
        codec,
        allowed_types: settings.session.allowed_types,
        allow_non_atomic_locks: settings.store.allow_non_atomic_locks,
        lock_timeout_secs,
        session_timeout_secs,
        config_dir,
    })
}

fn validate_endpoints(endpoints: &[String]) -> Result<(), ConfigError> {
    if endpoints.is_empty() {
        return Err(ConfigError::MissingKey {
            key: "store.endpoints (set CACHET_ENDPOINT or add to ~/.cachet/config.toml)".into(),
        });
    }
    for endpoint in endpoints {
        if !SUPPORTED_SCHEMES.iter().any(|s| endpoint.starts_with(s)) {
            return Err(ConfigError::InvalidValue {
                key: "store.endpoints".into(),
                message: format!(
                    "unsupported endpoint '{endpoint}' (expected one of {})",
                    SUPPORTED_SCHEMES.join(", ")
                ),
            });
        }
    }
    Ok(())
}

/// Get the Cachet config directory path (~/.cachet/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CACHET_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cachet")
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
