//! TTL'd verdict cache for URLs, commands and packages.
//!
//! URL entries live under the normalized URL, commands under their
//! SHA-256, packages under `registry:name[@version]`. TTLs differ by
//! verdict: malicious URLs are re-checked sooner than clean ones, and
//! freshly-published packages sooner than stable ones.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::engine::decision::{Decision, VerdictSeverity};
use crate::normalize::{hash_command, normalize_url};
use crate::state;

/// Commands are cached until manually invalidated.
const COMMAND_TTL_DAYS: i64 = 36_500;

/// Package TTL matrix (§ cache design).
const PACKAGE_DENY_TTL_SECS: i64 = 86_400;
const PACKAGE_ALLOW_STABLE_TTL_SECS: i64 = 86_400;
const PACKAGE_ALLOW_FRESH_TTL_SECS: i64 = 3_600;
const PACKAGE_OTHER_TTL_SECS: i64 = 3_600;

/// Packages younger than this re-check hourly even when clean.
const FRESH_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub verdict: Decision,
    pub severity: VerdictSeverity,
    pub reasons: Vec<String>,
    pub source: String,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    urls: BTreeMap<String, CachedEntry>,
    #[serde(default)]
    commands: BTreeMap<String, CachedEntry>,
    #[serde(default)]
    packages: BTreeMap<String, CachedEntry>,
}

#[derive(Debug)]
pub struct VerdictCache {
    path: PathBuf,
    enabled: bool,
    ttl_malicious: Duration,
    ttl_clean: Duration,
    data: CacheFile,
}

impl VerdictCache {
    pub fn open(config: &CacheConfig, path: &Path) -> Self {
        let data = if config.enabled {
            match state::read_json::<CacheFile>(path) {
                Ok(Some(data)) => data,
                Ok(None) => CacheFile::default(),
                Err(e) => {
                    warn!("Verdict cache unreadable, starting empty: {e:#}");
                    CacheFile::default()
                }
            }
        } else {
            CacheFile::default()
        };
        Self {
            path: path.to_path_buf(),
            enabled: config.enabled,
            ttl_malicious: Duration::seconds(config.ttl_malicious_seconds as i64),
            ttl_clean: Duration::seconds(config.ttl_clean_seconds as i64),
            data,
        }
    }

    /// Best-effort persistence: a failed save is logged, never fatal.
    pub fn save(&self) {
        if !self.enabled {
            return;
        }
        if let Err(e) = state::atomic_write_json(&self.path, &self.data) {
            warn!("Failed to persist verdict cache: {e:#}");
        }
    }

    pub fn get_url(&mut self, url: &str) -> Option<CachedEntry> {
        let key = normalize_url(url);
        Self::get_live(self.enabled, &mut self.data.urls, &key)
    }

    pub fn get_command(&mut self, command: &str) -> Option<CachedEntry> {
        let key = hash_command(command);
        Self::get_live(self.enabled, &mut self.data.commands, &key)
    }

    pub fn get_package(&mut self, key: &str) -> Option<CachedEntry> {
        Self::get_live(self.enabled, &mut self.data.packages, key)
    }

    /// Live-entry lookup; expired entries are deleted on read.
    fn get_live(
        enabled: bool,
        map: &mut BTreeMap<String, CachedEntry>,
        key: &str,
    ) -> Option<CachedEntry> {
        if !enabled {
            return None;
        }
        let entry = map.get(key)?;
        if entry.expires_at <= Utc::now() {
            debug!("Evicting expired cache entry for {key}");
            map.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    /// Cache a URL verdict that came from the URL-check client. The TTL
    /// follows the verdict: malicious answers are re-checked sooner.
    pub fn put_url(&mut self, url: &str, entry_verdict: Decision, is_malicious: bool, reasons: Vec<String>) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let ttl = if is_malicious {
            self.ttl_malicious
        } else {
            self.ttl_clean
        };
        let severity = if is_malicious {
            VerdictSeverity::Critical
        } else if entry_verdict == Decision::Ask {
            VerdictSeverity::Warning
        } else {
            VerdictSeverity::Info
        };
        self.data.urls.insert(
            normalize_url(url),
            CachedEntry {
                verdict: entry_verdict,
                severity,
                reasons,
                source: "url_check".to_string(),
                checked_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn put_command(&mut self, command: &str, entry: CachedEntry) {
        if !self.enabled {
            return;
        }
        let mut entry = entry;
        entry.expires_at = entry.checked_at + Duration::days(COMMAND_TTL_DAYS);
        self.data.commands.insert(hash_command(command), entry);
    }

    /// Package TTL matrix: deny 24h; allow 1h when the package is
    /// younger than a week, else 24h; anything else 1h.
    pub fn put_package(
        &mut self,
        key: &str,
        verdict: Decision,
        severity: VerdictSeverity,
        reasons: Vec<String>,
        age_days: Option<i64>,
    ) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let ttl_secs = match verdict {
            Decision::Deny => PACKAGE_DENY_TTL_SECS,
            Decision::Allow => {
                if age_days.map(|age| age < FRESH_AGE_DAYS).unwrap_or(false) {
                    PACKAGE_ALLOW_FRESH_TTL_SECS
                } else {
                    PACKAGE_ALLOW_STABLE_TTL_SECS
                }
            }
            Decision::Ask => PACKAGE_OTHER_TTL_SECS,
        };
        self.data.packages.insert(
            key.to_string(),
            CachedEntry {
                verdict,
                severity,
                reasons,
                source: "package_check".to_string(),
                checked_at: now,
                expires_at: now + Duration::seconds(ttl_secs),
            },
        );
    }

    /// Non-allow cached URL entries, in key order. Used to restore a
    /// cached reputation verdict when reputation was not re-queried.
    pub fn non_allow_urls(&self) -> impl Iterator<Item = (&String, &CachedEntry)> {
        self.data
            .urls
            .iter()
            .filter(|(_, entry)| entry.verdict != Decision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> VerdictCache {
        VerdictCache::open(&CacheConfig::default(), &dir.path().join("cache.json"))
    }

    #[test]
    fn test_url_roundtrip_normalized() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        cache.put_url("HTTP://Host.test/A?b=1&a=2", Decision::Deny, true, vec!["bad".into()]);
        cache.save();

        let mut reloaded = open(&dir);
        let entry = reloaded.get_url("http://host.test/A?a=2&b=1").unwrap();
        assert_eq!(entry.verdict, Decision::Deny);
        assert_eq!(entry.severity, VerdictSeverity::Critical);
    }

    #[test]
    fn test_malicious_ttl_shorter_than_clean() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        cache.put_url("https://bad.test/", Decision::Deny, true, vec![]);
        cache.put_url("https://good.test/", Decision::Allow, false, vec![]);
        let bad = cache.get_url("https://bad.test/").unwrap();
        let good = cache.get_url("https://good.test/").unwrap();
        assert!(bad.expires_at < good.expires_at);
    }

    #[test]
    fn test_expired_entry_deleted_on_read() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        let now = Utc::now();
        cache.data.urls.insert(
            normalize_url("https://old.test/"),
            CachedEntry {
                verdict: Decision::Deny,
                severity: VerdictSeverity::Critical,
                reasons: vec![],
                source: "url_check".to_string(),
                checked_at: now - Duration::hours(3),
                expires_at: now - Duration::hours(1),
            },
        );
        assert!(cache.get_url("https://old.test/").is_none());
        // Deleted, not just skipped.
        assert!(cache.data.urls.is_empty());
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let mut cache = VerdictCache::open(&config, &dir.path().join("cache.json"));
        cache.put_url("https://a.test/", Decision::Deny, true, vec![]);
        assert!(cache.get_url("https://a.test/").is_none());
        cache.save();
        assert!(!dir.path().join("cache.json").exists());
    }

    #[test]
    fn test_command_far_future_expiry() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        let now = Utc::now();
        cache.put_command(
            "cargo build",
            CachedEntry {
                verdict: Decision::Allow,
                severity: VerdictSeverity::Info,
                reasons: vec![],
                source: "heuristics".to_string(),
                checked_at: now,
                expires_at: now,
            },
        );
        let entry = cache.get_command("cargo build").unwrap();
        assert!(entry.expires_at > now + Duration::days(365));
    }

    #[test]
    fn test_package_ttl_matrix() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        let now = Utc::now();

        cache.put_package("npm:bad", Decision::Deny, VerdictSeverity::Critical, vec![], None);
        cache.put_package("npm:fresh", Decision::Allow, VerdictSeverity::Info, vec![], Some(2));
        cache.put_package("npm:stable", Decision::Allow, VerdictSeverity::Info, vec![], Some(400));
        cache.put_package("npm:odd", Decision::Ask, VerdictSeverity::Warning, vec![], None);

        let hours = |key: &str, cache: &mut VerdictCache| {
            let entry = cache.get_package(key).unwrap();
            (entry.expires_at - now).num_minutes() as f64 / 60.0
        };
        assert!((hours("npm:bad", &mut cache) - 24.0).abs() < 0.1);
        assert!((hours("npm:fresh", &mut cache) - 1.0).abs() < 0.1);
        assert!((hours("npm:stable", &mut cache) - 24.0).abs() < 0.1);
        assert!((hours("npm:odd", &mut cache) - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_non_allow_urls_iterator() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        cache.put_url("https://bad.test/", Decision::Deny, true, vec![]);
        cache.put_url("https://fine.test/", Decision::Allow, false, vec![]);
        let non_allow: Vec<_> = cache.non_allow_urls().collect();
        assert_eq!(non_allow.len(), 1);
        assert_eq!(non_allow[0].0, "https://bad.test/");
    }
}
