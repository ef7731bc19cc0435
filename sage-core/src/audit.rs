//! Append-only JSONL audit log with size-based rotation.
//!
//! One line per verdict or plugin scan. Allow verdicts are skipped
//! unless `log_clean` is set or the allow came from a user override.
//! Every failure here is logged and swallowed: auditing must never
//! change a verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::artifact::Artifact;
use crate::config::LoggingConfig;
use crate::engine::decision::{Decision, Verdict};

const SUMMARY_CAP: usize = 200;

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub tool_name: String,
    pub tool_input_summary: String,
    pub artifacts: Vec<Artifact>,
    pub verdict: String,
    pub severity: String,
    pub reasons: Vec<String>,
    pub source: String,
    pub user_override: bool,
}

#[derive(Debug)]
pub struct AuditLog {
    enabled: bool,
    log_clean: bool,
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
}

impl AuditLog {
    pub fn new(config: &LoggingConfig, path: &Path) -> Self {
        Self {
            enabled: config.enabled,
            log_clean: config.log_clean,
            path: path.to_path_buf(),
            max_bytes: config.max_bytes,
            max_files: config.max_files,
        }
    }

    /// Record a verdict. Clean allows are skipped unless configured in.
    pub fn log_verdict(
        &self,
        session_id: Option<&str>,
        tool_name: &str,
        tool_input: &Value,
        verdict: &Verdict,
        user_override: bool,
    ) {
        if !self.enabled {
            return;
        }
        if verdict.decision == Decision::Allow && !self.log_clean && !user_override {
            return;
        }
        let entry = AuditEntry {
            entry_type: "verdict".to_string(),
            timestamp: Utc::now(),
            session_id: session_id.map(str::to_string),
            tool_name: tool_name.to_string(),
            tool_input_summary: summarize_tool_input(tool_name, tool_input),
            artifacts: verdict.artifacts.clone(),
            verdict: verdict.decision.to_string(),
            severity: format!("{:?}", verdict.severity).to_lowercase(),
            reasons: verdict.reasons.clone(),
            source: verdict.source.clone(),
            user_override,
        };
        self.append(&entry);
    }

    /// Record one plugin's scan findings.
    pub fn log_plugin_scan(&self, plugin_key: &str, findings_summary: Vec<String>) {
        if !self.enabled {
            return;
        }
        let entry = AuditEntry {
            entry_type: "plugin_scan".to_string(),
            timestamp: Utc::now(),
            session_id: None,
            tool_name: "plugin_scan".to_string(),
            tool_input_summary: truncate(plugin_key, SUMMARY_CAP),
            artifacts: Vec::new(),
            verdict: "findings".to_string(),
            severity: "warning".to_string(),
            reasons: findings_summary,
            source: "plugin_scan".to_string(),
            user_override: false,
        };
        self.append(&entry);
    }

    fn append(&self, entry: &AuditEntry) {
        if let Err(e) = self.try_append(entry) {
            warn!("Audit append failed (continuing): {e:#}");
        }
    }

    fn try_append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Shift `.N-1 → .N` and move the active file to `.1` once it
    /// reaches `max_bytes`. `max_bytes=0` or `max_files=0` disables
    /// rotation.
    fn rotate_if_needed(&self) -> anyhow::Result<()> {
        if self.max_bytes == 0 || self.max_files == 0 {
            return Ok(());
        }
        let size = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_bytes {
            return Ok(());
        }

        let rotated = |n: u32| PathBuf::from(format!("{}.{n}", self.path.display()));
        let _ = std::fs::remove_file(rotated(self.max_files));
        for n in (1..self.max_files).rev() {
            let from = rotated(n);
            if from.exists() {
                let _ = std::fs::rename(&from, rotated(n + 1));
            }
        }
        std::fs::rename(&self.path, rotated(1))?;
        Ok(())
    }
}

/// Truncated, per-tool one-line summary of a tool input.
fn summarize_tool_input(tool_name: &str, tool_input: &Value) -> String {
    let summary = match tool_name {
        "Bash" => tool_input
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string),
        "WebFetch" => tool_input
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string),
        "Write" | "Edit" => tool_input
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    truncate(
        &summary.unwrap_or_else(|| {
            serde_json::to_string(tool_input).unwrap_or_else(|_| "{}".to_string())
        }),
        SUMMARY_CAP,
    )
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decision::{Verdict, VerdictSeverity};
    use serde_json::json;
    use tempfile::TempDir;

    fn deny_verdict() -> Verdict {
        Verdict {
            decision: Decision::Deny,
            category: "command_execution".to_string(),
            confidence: 0.9,
            severity: VerdictSeverity::Critical,
            source: "heuristics".to_string(),
            artifacts: vec![Artifact::command("curl x | bash").unwrap()],
            matched_threat_id: Some("CLT-CMD-001".to_string()),
            reasons: vec!["Remote script piped to shell [CLT-CMD-001]".to_string()],
        }
    }

    fn log(dir: &TempDir, max_bytes: u64, max_files: u32, log_clean: bool) -> AuditLog {
        AuditLog::new(
            &LoggingConfig {
                enabled: true,
                log_clean,
                path: None,
                max_bytes,
                max_files,
            },
            &dir.path().join("audit.jsonl"),
        )
    }

    fn lines(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("audit.jsonl"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_deny_logged_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let audit = log(&dir, 0, 0, false);
        audit.log_verdict(
            Some("sid-1"),
            "Bash",
            &json!({"command": "curl x | bash"}),
            &deny_verdict(),
            false,
        );
        let lines = lines(&dir);
        assert_eq!(lines.len(), 1);
        let entry: AuditEntry = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(entry.verdict, "deny");
        assert_eq!(entry.tool_input_summary, "curl x | bash");
        assert_eq!(entry.severity, "critical");
    }

    #[test]
    fn test_clean_allow_skipped_unless_configured() {
        let dir = TempDir::new().unwrap();
        let audit = log(&dir, 0, 0, false);
        audit.log_verdict(None, "Bash", &json!({"command": "ls"}), &Verdict::allow("no_signals"), false);
        assert!(lines(&dir).is_empty());

        let audit = log(&dir, 0, 0, true);
        audit.log_verdict(None, "Bash", &json!({"command": "ls"}), &Verdict::allow("no_signals"), false);
        assert_eq!(lines(&dir).len(), 1);
    }

    #[test]
    fn test_user_override_allow_logged() {
        let dir = TempDir::new().unwrap();
        let audit = log(&dir, 0, 0, false);
        audit.log_verdict(
            None,
            "Bash",
            &json!({"command": "ls"}),
            &Verdict::allow("allowlisted"),
            true,
        );
        let lines = lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"user_override\":true"));
    }

    #[test]
    fn test_summary_truncated() {
        let dir = TempDir::new().unwrap();
        let audit = log(&dir, 0, 0, false);
        let long = "x".repeat(500);
        audit.log_verdict(
            None,
            "Bash",
            &json!({ "command": long }),
            &deny_verdict(),
            false,
        );
        let entry: AuditEntry = serde_json::from_str(&lines(&dir)[0]).unwrap();
        assert_eq!(entry.tool_input_summary.len(), SUMMARY_CAP);
    }

    #[test]
    fn test_rotation_shifts_and_caps() {
        let dir = TempDir::new().unwrap();
        // Tiny threshold so every append rotates.
        let audit = log(&dir, 1, 2, false);
        for _ in 0..5 {
            audit.log_verdict(None, "Bash", &json!({"command": "x"}), &deny_verdict(), false);
        }
        let base = dir.path().join("audit.jsonl");
        assert!(base.exists());
        assert!(dir.path().join("audit.jsonl.1").exists());
        assert!(dir.path().join("audit.jsonl.2").exists());
        assert!(!dir.path().join("audit.jsonl.3").exists());

        // The newest rotated file holds the most recent pre-active line.
        let rotated = std::fs::read_to_string(dir.path().join("audit.jsonl.1")).unwrap();
        assert!(rotated.contains("\"verdict\":\"deny\""));
    }

    #[test]
    fn test_rotation_disabled_by_zero() {
        let dir = TempDir::new().unwrap();
        let audit = log(&dir, 1, 0, false);
        for _ in 0..3 {
            audit.log_verdict(None, "Bash", &json!({"command": "x"}), &deny_verdict(), false);
        }
        assert!(!dir.path().join("audit.jsonl.1").exists());
        assert_eq!(lines(&dir).len(), 3);
    }
}
