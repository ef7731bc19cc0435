//! State directory layout and atomic file writes.
//!
//! All mutable on-disk state (allowlist, verdict cache, plugin scan
//! cache, approvals) is written atomically: serialize to a temp file in
//! the target directory, then rename into place. Readers see either the
//! old file or a complete new one, never a torn write.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.json";
pub const ALLOWLIST_FILE: &str = "allowlist.json";
pub const CACHE_FILE: &str = "cache.json";
pub const PLUGIN_SCAN_CACHE_FILE: &str = "plugin_scan_cache.json";
pub const AUDIT_FILE: &str = "audit.jsonl";
pub const THREATS_DIR: &str = "threats";
pub const TRUSTED_DIR: &str = "trusted";

/// Temp files older than this are leftovers from a crashed process.
const STALE_TMP_AGE: Duration = Duration::from_secs(300);

/// Default state directory: `~/.sage`.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sage")
}

/// Write `contents` to `path` atomically.
///
/// The temp file is created as `{path}.{uuid}.tmp` with mode 0600 and
/// renamed into place. On rename failure the temp file is unlinked.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("atomic write target has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create state dir {}", parent.display()))?;

    let tmp = parent.join(format!(
        "{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string()),
        uuid::Uuid::new_v4().simple()
    ));

    write_private(&tmp, contents)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
    }
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    atomic_write(path, &json)
}

/// Read and deserialize a JSON state file. `Ok(None)` when the file does
/// not exist; `Err` on unreadable or unparseable content so callers can
/// decide whether to fail open.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Remove `.tmp` files in the state directory older than five minutes.
/// Run at hook startup to clean up after crashed processes.
pub fn prune_stale_tmp_files(state_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(state_dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e != "tmp").unwrap_or(true) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if let Some(age) = age {
            if age > STALE_TMP_AGE {
                debug!("Pruning stale temp file {}", path.display());
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to prune {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let mut data = HashMap::new();
        data.insert("key".to_string(), 42u64);

        atomic_write_json(&path, &data).unwrap();
        let read: HashMap<String, u64> = read_json(&path).unwrap().unwrap();
        assert_eq!(read, data);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        atomic_write_json(&path, &vec![1u32]).unwrap();
        atomic_write_json(&path, &vec![1u32, 2]).unwrap();
        let read: Vec<u32> = read_json(&path).unwrap().unwrap();
        assert_eq!(read, vec![1, 2]);
    }

    #[test]
    fn test_read_json_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let read: Option<Vec<u32>> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn test_prune_stale_tmp_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("cache.json.deadbeef.tmp");
        let fresh = dir.path().join("cache.json.cafe.tmp");
        std::fs::write(&stale, b"{}").unwrap();
        std::fs::write(&fresh, b"{}").unwrap();

        // Backdate the stale file's mtime past the threshold.
        let old = SystemTime::now() - Duration::from_secs(600);
        let file = std::fs::File::options().write(true).open(&stale).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        prune_stale_tmp_files(dir.path());
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        atomic_write(&path, b"{}").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
