//! Pending and consumed approvals bridging `ask` verdicts across calls.
//!
//! A pending approval is written when a verdict asks for confirmation;
//! consuming it records one consumed entry per artifact and removes the
//! pending record (one-shot). During the consumed TTL an identical
//! payload passes without re-prompting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ArtifactKind};
use crate::state;

const PENDING_TTL_SECS: i64 = 3_600;
const CONSUMED_TTL_MINUTES: i64 = 10;
/// Shortened replay window under paranoid sensitivity.
const CONSUMED_TTL_MINUTES_PARANOID: i64 = 2;
/// Approval files untouched longer than this get swept at startup.
const STALE_FILE_AGE_SECS: u64 = 7_200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub threat_id: Option<String>,
    pub threat_title: String,
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn new(threat_id: Option<String>, threat_title: String, artifacts: Vec<Artifact>) -> Self {
        Self {
            threat_id,
            threat_title,
            artifacts,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedApproval {
    pub artifact_kind: ArtifactKind,
    pub artifact_value: String,
    pub expires_at: DateTime<Utc>,
}

/// Stable digest of `(tool, params)`: identical retries across
/// processes produce the same id. Params are round-tripped through
/// `serde_json::Value`, whose object keys serialize sorted.
pub fn action_id(tool: &str, params: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub struct ApprovalStore {
    dir: PathBuf,
    paranoid: bool,
}

impl ApprovalStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            paranoid: false,
        }
    }

    /// Paranoid sensitivity shortens the consumed replay window.
    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    fn pending_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("pending-approvals-{}.json", sanitize(session_id)))
    }

    fn consumed_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("consumed-approvals-{}.json", sanitize(session_id)))
    }

    fn consumed_ttl(&self) -> Duration {
        Duration::minutes(if self.paranoid {
            CONSUMED_TTL_MINUTES_PARANOID
        } else {
            CONSUMED_TTL_MINUTES
        })
    }

    /// Record a pending approval keyed by tool-use id, pruning expired
    /// entries first.
    pub fn add_pending(
        &self,
        session_id: &str,
        tool_use_id: &str,
        record: PendingApproval,
    ) -> anyhow::Result<()> {
        let path = self.pending_path(session_id);
        let mut pending = load_map::<PendingApproval>(&path);
        let cutoff = Utc::now() - Duration::seconds(PENDING_TTL_SECS);
        pending.retain(|_, p| p.created_at > cutoff);
        pending.insert(tool_use_id.to_string(), record);
        state::atomic_write_json(&path, &pending)
    }

    /// One-shot consumption: remove the pending record and write one
    /// consumed entry per artifact. Returns the pending record, or
    /// `None` if absent or already consumed.
    pub fn consume_pending(
        &self,
        session_id: &str,
        tool_use_id: &str,
    ) -> anyhow::Result<Option<PendingApproval>> {
        let pending_path = self.pending_path(session_id);
        let mut pending = load_map::<PendingApproval>(&pending_path);
        let Some(record) = pending.remove(tool_use_id) else {
            return Ok(None);
        };
        state::atomic_write_json(&pending_path, &pending)?;

        let consumed_path = self.consumed_path(session_id);
        let mut consumed = load_map::<ConsumedApproval>(&consumed_path);
        let expires_at = Utc::now() + self.consumed_ttl();
        for artifact in &record.artifacts {
            consumed.insert(
                consumed_key(artifact.kind, &artifact.value),
                ConsumedApproval {
                    artifact_kind: artifact.kind,
                    artifact_value: artifact.value.clone(),
                    expires_at,
                },
            );
        }
        state::atomic_write_json(&consumed_path, &consumed)?;
        debug!(
            "Consumed approval {tool_use_id} ({} artifacts)",
            record.artifacts.len()
        );
        Ok(Some(record))
    }

    /// Live consumed entry for one artifact in one session. Expired
    /// entries are pruned and the prune persisted.
    pub fn find_consumed(
        &self,
        session_id: &str,
        kind: ArtifactKind,
        value: &str,
    ) -> Option<ConsumedApproval> {
        let path = self.consumed_path(session_id);
        let mut consumed = load_map::<ConsumedApproval>(&path);
        let before = consumed.len();
        let now = Utc::now();
        consumed.retain(|_, c| c.expires_at > now);
        if consumed.len() != before {
            if let Err(e) = state::atomic_write_json(&path, &consumed) {
                warn!("Failed to persist consumed-approval prune: {e:#}");
            }
        }
        consumed.get(&consumed_key(kind, value)).cloned()
    }

    /// Cross-session lookup: scan every consumed-approvals file.
    pub fn find_consumed_any_session(
        &self,
        kind: ArtifactKind,
        value: &str,
    ) -> Option<ConsumedApproval> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let key = consumed_key(kind, value);
        let now = Utc::now();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("consumed-approvals-") || !name.ends_with(".json") {
                continue;
            }
            let consumed = load_map::<ConsumedApproval>(&entry.path());
            if let Some(approval) = consumed.get(&key) {
                if approval.expires_at > now {
                    return Some(approval.clone());
                }
            }
        }
        None
    }

    /// Startup sweep: rewrite (or delete) any approval file untouched
    /// for more than two hours, dropping expired entries.
    pub fn prune_stale_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let now_sys = SystemTime::now();
        let now = Utc::now();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            let is_pending = name.starts_with("pending-approvals-");
            let is_consumed = name.starts_with("consumed-approvals-");
            if (!is_pending && !is_consumed) || !name.ends_with(".json") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now_sys.duration_since(modified).ok())
                .map(|age| age.as_secs() > STALE_FILE_AGE_SECS)
                .unwrap_or(false);
            if !stale {
                continue;
            }
            let path = entry.path();
            if is_pending {
                let mut pending = load_map::<PendingApproval>(&path);
                pending.retain(|_, p| p.created_at > now - Duration::seconds(PENDING_TTL_SECS));
                rewrite_or_delete(&path, &pending);
            } else {
                let mut consumed = load_map::<ConsumedApproval>(&path);
                consumed.retain(|_, c| c.expires_at > now);
                rewrite_or_delete(&path, &consumed);
            }
        }
    }
}

fn consumed_key(kind: ArtifactKind, value: &str) -> String {
    format!("{kind}:{value}")
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn load_map<T: serde::de::DeserializeOwned>(path: &Path) -> BTreeMap<String, T> {
    match state::read_json::<BTreeMap<String, T>>(path) {
        Ok(Some(map)) => map,
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            warn!("Approval file {} unreadable: {e:#}", path.display());
            BTreeMap::new()
        }
    }
}

fn rewrite_or_delete<T: Serialize>(path: &Path, map: &BTreeMap<String, T>) {
    if map.is_empty() {
        debug!("Deleting empty approval file {}", path.display());
        let _ = std::fs::remove_file(path);
    } else if let Err(e) = state::atomic_write_json(path, map) {
        warn!("Failed to rewrite approval file {}: {e:#}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(values: &[&str]) -> PendingApproval {
        PendingApproval {
            threat_id: Some("CLT-CMD-001".to_string()),
            threat_title: "Remote script piped to shell".to_string(),
            artifacts: values
                .iter()
                .map(|v| Artifact::command(*v).unwrap())
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_action_id_stable_across_key_order() {
        let a = action_id("Bash", &json!({"command": "ls", "timeout": 5}));
        let b = action_id("Bash", &json!({"timeout": 5, "command": "ls"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, action_id("Bash", &json!({"command": "ls -la"})));
        assert_ne!(a, action_id("Write", &json!({"command": "ls", "timeout": 5})));
    }

    #[test]
    fn test_pending_consume_one_shot() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        store
            .add_pending("sid-1", "toolu_1", record(&["curl x | bash"]))
            .unwrap();

        let consumed = store.consume_pending("sid-1", "toolu_1").unwrap();
        assert!(consumed.is_some());
        assert_eq!(consumed.unwrap().artifacts.len(), 1);

        // One-shot: a second consume finds nothing.
        assert!(store.consume_pending("sid-1", "toolu_1").unwrap().is_none());
    }

    #[test]
    fn test_consumed_entry_per_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        store
            .add_pending("sid-1", "toolu_1", record(&["cmd-a", "cmd-b"]))
            .unwrap();
        store.consume_pending("sid-1", "toolu_1").unwrap();

        assert!(store
            .find_consumed("sid-1", ArtifactKind::Command, "cmd-a")
            .is_some());
        assert!(store
            .find_consumed("sid-1", ArtifactKind::Command, "cmd-b")
            .is_some());
        assert!(store
            .find_consumed("sid-1", ArtifactKind::Command, "cmd-c")
            .is_none());
        // Kind is part of the key.
        assert!(store
            .find_consumed("sid-1", ArtifactKind::Url, "cmd-a")
            .is_none());
    }

    #[test]
    fn test_cross_session_lookup() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        store
            .add_pending("sid-other", "toolu_9", record(&["shared"]))
            .unwrap();
        store.consume_pending("sid-other", "toolu_9").unwrap();

        assert!(store
            .find_consumed("sid-mine", ArtifactKind::Command, "shared")
            .is_none());
        assert!(store
            .find_consumed_any_session(ArtifactKind::Command, "shared")
            .is_some());
    }

    #[test]
    fn test_expired_consumed_pruned() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        let path = store.consumed_path("sid-1");
        let mut consumed = BTreeMap::new();
        consumed.insert(
            consumed_key(ArtifactKind::Command, "old"),
            ConsumedApproval {
                artifact_kind: ArtifactKind::Command,
                artifact_value: "old".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
            },
        );
        state::atomic_write_json(&path, &consumed).unwrap();

        assert!(store
            .find_consumed("sid-1", ArtifactKind::Command, "old")
            .is_none());
        let on_disk = load_map::<ConsumedApproval>(&path);
        assert!(on_disk.is_empty());
    }

    #[test]
    fn test_stale_file_sweep_deletes_empty() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        let path = store.consumed_path("sid-old");
        let mut consumed = BTreeMap::new();
        consumed.insert(
            consumed_key(ArtifactKind::Command, "x"),
            ConsumedApproval {
                artifact_kind: ArtifactKind::Command,
                artifact_value: "x".to_string(),
                expires_at: Utc::now() - Duration::hours(3),
            },
        );
        state::atomic_write_json(&path, &consumed).unwrap();

        // Backdate the file past the sweep threshold.
        let old = SystemTime::now() - std::time::Duration::from_secs(3 * 3600);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        store.prune_stale_files();
        assert!(!path.exists());
    }

    #[test]
    fn test_session_id_sanitized() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        store
            .add_pending("../../escape", "toolu_1", record(&["x"]))
            .unwrap();
        // The file lands inside the store dir, not outside it.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("pending-approvals-"));
        assert!(!names[0].contains(".."));
    }
}
