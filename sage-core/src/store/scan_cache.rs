//! Plugin scan cache.
//!
//! Scan results are keyed by `plugin_key:version:last_updated` and kept
//! for seven days. The whole cache is invalidated when the config hash
//! (Sage version + threat/trusted YAML contents) changes, since a new
//! rule corpus can find what the old one missed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::plugin_scan::Finding;
use crate::state;

const ENTRY_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCacheEntry {
    pub scanned_at: DateTime<Utc>,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScanCacheFile {
    #[serde(default)]
    config_hash: String,
    #[serde(default)]
    entries: BTreeMap<String, ScanCacheEntry>,
}

#[derive(Debug)]
pub struct PluginScanCache {
    path: PathBuf,
    data: ScanCacheFile,
}

impl PluginScanCache {
    /// Open the cache; entries are dropped wholesale when `config_hash`
    /// differs from the persisted one.
    pub fn open(path: &Path, config_hash: &str) -> Self {
        let mut data = match state::read_json::<ScanCacheFile>(path) {
            Ok(Some(data)) => data,
            Ok(None) => ScanCacheFile::default(),
            Err(e) => {
                warn!("Plugin scan cache unreadable, starting empty: {e:#}");
                ScanCacheFile::default()
            }
        };
        if data.config_hash != config_hash {
            debug!("Config hash changed; invalidating plugin scan cache");
            data.entries.clear();
            data.config_hash = config_hash.to_string();
        }
        Self {
            path: path.to_path_buf(),
            data,
        }
    }

    pub fn save(&self) {
        if let Err(e) = state::atomic_write_json(&self.path, &self.data) {
            warn!("Failed to persist plugin scan cache: {e:#}");
        }
    }

    /// Live entry for a plugin, honoring the per-entry TTL.
    pub fn get(&self, key: &str) -> Option<&ScanCacheEntry> {
        let entry = self.data.entries.get(key)?;
        if Utc::now() - entry.scanned_at > Duration::days(ENTRY_TTL_DAYS) {
            return None;
        }
        Some(entry)
    }

    pub fn put(&mut self, key: &str, findings: Vec<Finding>) {
        self.data.entries.insert(
            key.to_string(),
            ScanCacheEntry {
                scanned_at: Utc::now(),
                findings,
            },
        );
    }
}

/// Cache key for one installed plugin at one version.
pub fn plugin_cache_key(key: &str, version: &str, last_updated: &str) -> String {
    format!("{key}:{version}:{last_updated}")
}

/// SHA-256 over the Sage version and the contents of the threat and
/// trusted YAML directories, in sorted file order.
pub fn compute_config_hash(threats_dir: &Path, trusted_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(crate::PRODUCT_VERSION.as_bytes());
    for dir in [threats_dir, trusted_dir] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            hasher.update(path.to_string_lossy().as_bytes());
            if let Ok(content) = std::fs::read(&path) {
                hasher.update(&content);
            }
        }
    }
    hex::encode(hasher.finalize())
}
