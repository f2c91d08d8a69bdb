//! Engine configuration
//!
//! Loaded from an optional JSON file and then overridden from
//! `ORCHESTRATION_ENGINE_*` environment variables. Every field has a
//! default so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "ORCHESTRATION_ENGINE_";

mod defaults {
    pub const MAX_CAS_RETRIES: u32 = 8;
    pub const MAX_TASK_CHAIN_LENGTH: u32 = 32;
    pub const TASK_TIMEOUT_MS: u64 = 10 * 60 * 1000;
    pub const BARRIER_TIMEOUT_MS: u64 = 60 * 60 * 1000;
    pub const TIMER_POLL_INTERVAL_MS: u64 = 1000;
    pub const PAYLOAD_COMPRESSION_THRESHOLD: usize = 4096;
}

/// Which store backs the engine's repositories
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreConfig {
    /// Process-local maps; state is lost on restart
    #[default]
    InMemory,
    /// SQLite database file shared by every engine instance
    Sqlite { path: PathBuf },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Re-read attempts after a version conflict before giving up
    pub max_cas_retries: u32,
    /// Upper bound on links in one task chain
    pub max_task_chain_length: u32,
    /// Deadline for a dispatched task that does not declare one
    pub default_task_timeout_ms: u64,
    /// Barrier wait before it times out, counted from the first arrival
    pub default_barrier_timeout_ms: u64,
    /// Interval of the background timer loop
    pub timer_poll_interval_ms: u64,
    /// Outputs larger than this are stored zstd-compressed
    pub payload_compression_threshold: usize,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: defaults::MAX_CAS_RETRIES,
            max_task_chain_length: defaults::MAX_TASK_CHAIN_LENGTH,
            default_task_timeout_ms: defaults::TASK_TIMEOUT_MS,
            default_barrier_timeout_ms: defaults::BARRIER_TIMEOUT_MS,
            timer_poll_interval_ms: defaults::TIMER_POLL_INTERVAL_MS,
            payload_compression_threshold: defaults::PAYLOAD_COMPRESSION_THRESHOLD,
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Apply overrides looked up by full variable name (e.g. `ORCHESTRATION_ENGINE_MAX_CAS_RETRIES`)
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("MAX_CAS_RETRIES") {
            self.max_cas_retries = parse_var("MAX_CAS_RETRIES", &v)?;
        }
        if let Some(v) = get("MAX_TASK_CHAIN_LENGTH") {
            self.max_task_chain_length = parse_var("MAX_TASK_CHAIN_LENGTH", &v)?;
        }
        if let Some(v) = get("DEFAULT_TASK_TIMEOUT_MS") {
            self.default_task_timeout_ms = parse_var("DEFAULT_TASK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("DEFAULT_BARRIER_TIMEOUT_MS") {
            self.default_barrier_timeout_ms = parse_var("DEFAULT_BARRIER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("TIMER_POLL_INTERVAL_MS") {
            self.timer_poll_interval_ms = parse_var("TIMER_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("PAYLOAD_COMPRESSION_THRESHOLD") {
            self.payload_compression_threshold = parse_var("PAYLOAD_COMPRESSION_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SQLITE_PATH") {
            self.store = StoreConfig::Sqlite {
                path: PathBuf::from(v),
            };
        }
        Ok(self)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn default_barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.default_barrier_timeout_ms)
    }

    pub fn timer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timer_poll_interval_ms.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        EngineError::Config(format!(
            "{}{} has an invalid value '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_json_file_with_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"maxCasRetries": 3, "store": {"kind": "sqlite", "path": "/tmp/engine.db"}}"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_cas_retries, 3);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/tmp/engine.db")
            }
        );
        assert_eq!(config.max_task_chain_length, defaults::MAX_TASK_CHAIN_LENGTH);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<String, String> = [
            ("ORCHESTRATION_ENGINE_MAX_TASK_CHAIN_LENGTH", "4"),
            ("ORCHESTRATION_ENGINE_DEFAULT_TASK_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = EngineConfig::default()
            .apply_overrides(|key| vars.get(key).cloned())
            .unwrap();
        assert_eq!(config.max_task_chain_length, 4);
        assert_eq!(config.default_task_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let err = EngineConfig::default()
            .apply_overrides(|key| {
                (key == "ORCHESTRATION_ENGINE_MAX_CAS_RETRIES").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
