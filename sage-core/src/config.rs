//! Configuration loading with full-default fallback.
//!
//! The config surface is a single JSON object in which every field has a
//! default. A missing, malformed or non-object `config.json` yields the
//! complete default configuration rather than an error: the hook must
//! never fail because the user's config is broken.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::engine::decision::Sensitivity;
use crate::state;

/// Reputation client settings shared by the URL, file and package checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub enabled: bool,
    pub timeout_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 5.0,
            endpoint: None,
        }
    }
}

/// Verdict cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_malicious_seconds: u64,
    pub ttl_clean_seconds: u64,
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_malicious_seconds: 3600,
            ttl_clean_seconds: 86400,
            path: None,
        }
    }
}

/// Allowlist store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    pub path: Option<PathBuf>,
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_clean: bool,
    pub path: Option<PathBuf>,
    pub max_bytes: u64,
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_clean: false,
            path: None,
            max_bytes: 5_242_880,
            max_files: 3,
        }
    }
}

/// Top-level Sage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub url_check: CheckConfig,
    pub file_check: CheckConfig,
    pub package_check: CheckConfig,
    pub heuristics_enabled: bool,
    pub cache: CacheConfig,
    pub allowlist: AllowlistConfig,
    pub logging: LoggingConfig,
    pub sensitivity: Sensitivity,
    pub disabled_threats: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url_check: CheckConfig::default(),
            file_check: CheckConfig::default(),
            package_check: CheckConfig::default(),
            heuristics_enabled: true,
            cache: CacheConfig::default(),
            allowlist: AllowlistConfig::default(),
            logging: LoggingConfig::default(),
            sensitivity: Sensitivity::Balanced,
            disabled_threats: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to full defaults
    /// on any failure.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No config at {}: {e}; using defaults", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Malformed config at {}: {e}; using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Resolved cache file path.
    pub fn cache_path(&self, state_dir: &Path) -> PathBuf {
        self.cache
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join(state::CACHE_FILE))
    }

    /// Resolved allowlist file path.
    pub fn allowlist_path(&self, state_dir: &Path) -> PathBuf {
        self.allowlist
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join(state::ALLOWLIST_FILE))
    }

    /// Resolved audit log path.
    pub fn audit_path(&self, state_dir: &Path) -> PathBuf {
        self.logging
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join(state::AUDIT_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.json"));
        assert!(config.url_check.enabled);
        assert_eq!(config.cache.ttl_malicious_seconds, 3600);
        assert_eq!(config.cache.ttl_clean_seconds, 86400);
        assert_eq!(config.sensitivity, Sensitivity::Balanced);
        assert_eq!(config.logging.max_bytes, 5_242_880);
        assert_eq!(config.logging.max_files, 3);
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json {{{").unwrap();
        let config = Config::load(&path);
        assert!(config.heuristics_enabled);
    }

    #[test]
    fn test_non_object_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        let config = Config::load(&path);
        assert!(config.package_check.enabled);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"sensitivity": "paranoid", "url_check": {"enabled": false}}"#,
        )
        .unwrap();
        let config = Config::load(&path);
        assert_eq!(config.sensitivity, Sensitivity::Paranoid);
        assert!(!config.url_check.enabled);
        // Untouched sections keep their defaults.
        assert!((config.url_check.timeout_seconds - 5.0).abs() < f64::EPSILON);
        assert!(config.file_check.enabled);
    }

    #[test]
    fn test_disabled_threats_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"disabled_threats": ["CLT-CMD-009"]}"#).unwrap();
        let config = Config::load(&path);
        assert_eq!(config.disabled_threats, vec!["CLT-CMD-009".to_string()]);
    }
}
