//! Session-start threat scan of installed host plugins.
//!
//! Each plugin's install tree is walked shallow-first with hard bounds:
//! vendored/VCS directories are skipped, only a fixed extension set is
//! read, files are capped at 512 KiB, and symlinks are not followed.
//! Script lines become command artifacts for the heuristic engine;
//! URLs and file hashes are batched through the reputation clients.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::{Artifact, ArtifactKind};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::engine::heuristics::HeuristicsEngine;
use crate::engine::SagePaths;
use crate::extract::extract_urls;
use crate::reputation::{FileCheckClient, UrlCheckClient, SEVERITY_MALWARE};
use crate::store::scan_cache::{compute_config_hash, plugin_cache_key, PluginScanCache};
use crate::threat::trusted::TrustedDomains;
use crate::threat::load_threats;

const MAX_FILE_BYTES: u64 = 512 * 1024;
const ARTIFACT_CAP: usize = 200;
const SKIP_DIRS: [&str; 3] = ["node_modules", ".git", "__pycache__"];
const SCANNABLE_EXTS: [&str; 16] = [
    "sh", "bash", "zsh", "py", "js", "ts", "jsx", "tsx", "mjs", "cjs", "json", "yaml", "yml",
    "toml", "md", "txt",
];
const SCRIPT_EXTS: [&str; 4] = ["sh", "bash", "zsh", "py"];

/// Plugins whose key starts with this are Sage's own surface.
const SELF_KEY_PREFIX: &str = "sage";

/// One installed plugin, as enumerated by the host adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    pub key: String,
    pub install_path: PathBuf,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub last_updated: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    Heuristic,
    UrlCheck,
    FileCheck,
}

/// One suspicious observation inside a plugin tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub title: String,
    pub severity: String,
    pub source_file: String,
    pub artifact: String,
}

/// Scan outcome for one plugin.
#[derive(Debug, Clone)]
pub struct PluginScanReport {
    pub plugin_key: String,
    pub findings: Vec<Finding>,
    pub from_cache: bool,
}

pub struct PluginScanner {
    paths: SagePaths,
    config: Config,
}

impl PluginScanner {
    pub fn new(paths: SagePaths, config: Config) -> Self {
        Self { paths, config }
    }

    /// Scan every installed plugin, consulting and updating the scan
    /// cache, and audit plugins with findings.
    pub async fn scan_session(&self, plugins: &[PluginInfo]) -> Vec<PluginScanReport> {
        let config_hash =
            compute_config_hash(&self.paths.threats_dir(), &self.paths.trusted_dir());
        let mut cache =
            PluginScanCache::open(&self.paths.plugin_scan_cache_path(), &config_hash);
        let audit = AuditLog::new(
            &self.config.logging,
            &self.config.audit_path(&self.paths.state_dir),
        );

        let rules = load_threats(&self.paths.threats_dir(), &self.config.disabled_threats);
        let trusted = TrustedDomains::load(&self.paths.trusted_dir());
        let engine =
            HeuristicsEngine::new(rules, trusted).restricted_to(ArtifactKind::Command);

        let mut reports = Vec::new();
        for plugin in plugins {
            if plugin.key.starts_with(SELF_KEY_PREFIX) {
                debug!("Skipping self plugin {}", plugin.key);
                continue;
            }
            let cache_key =
                plugin_cache_key(&plugin.key, &plugin.version, &plugin.last_updated);

            if let Some(entry) = cache.get(&cache_key) {
                if entry.findings.is_empty() {
                    debug!("Plugin {} clean in cache; skipping", plugin.key);
                    continue;
                }
                info!(
                    "Plugin {} has {} cached finding(s)",
                    plugin.key,
                    entry.findings.len()
                );
                reports.push(PluginScanReport {
                    plugin_key: plugin.key.clone(),
                    findings: entry.findings.clone(),
                    from_cache: true,
                });
                continue;
            }

            let findings = self.scan_plugin(plugin, &engine).await;
            cache.put(&cache_key, findings.clone());
            if !findings.is_empty() {
                audit.log_plugin_scan(
                    &plugin.key,
                    findings
                        .iter()
                        .map(|f| format!("{}: {}", f.source_file, f.title))
                        .collect(),
                );
            }
            reports.push(PluginScanReport {
                plugin_key: plugin.key.clone(),
                findings,
                from_cache: false,
            });
        }

        cache.save();
        reports
    }

    /// Scan one plugin tree: heuristics per file, then batched URL and
    /// file-hash reputation over the aggregate.
    async fn scan_plugin(&self, plugin: &PluginInfo, engine: &HeuristicsEngine) -> Vec<Finding> {
        let root = &plugin.install_path;
        let mut findings = Vec::new();
        let mut all_urls: HashSet<String> = HashSet::new();
        let mut hash_sources: Vec<(String, String)> = Vec::new();

        for file in scannable_files(root) {
            let relative = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .to_string_lossy()
                .into_owned();
            let Ok(bytes) = std::fs::read(&file) else {
                warn!("Unreadable plugin file {}", file.display());
                continue;
            };
            let content = String::from_utf8_lossy(&bytes);

            all_urls.extend(extract_urls(&content));
            hash_sources.push((hex::encode(Sha256::digest(&bytes)), relative.clone()));

            let artifacts = script_line_artifacts(&file, &content);
            for hit in engine.matches(&artifacts) {
                findings.push(Finding {
                    kind: FindingKind::Heuristic,
                    rule_id: Some(hit.rule.id.clone()),
                    title: hit.rule.title.clone(),
                    severity: hit.rule.severity.as_str().to_string(),
                    source_file: relative.clone(),
                    artifact: truncate(&hit.artifact_value, ARTIFACT_CAP),
                });
            }
        }

        // Reputation over the aggregate, URL and file checks in
        // parallel, both fail-open.
        let urls: Vec<String> = all_urls.into_iter().collect();
        let hashes: Vec<String> = hash_sources.iter().map(|(hash, _)| hash.clone()).collect();
        let url_client = UrlCheckClient::from_config(&self.config.url_check);
        let file_client = FileCheckClient::from_config(&self.config.file_check);

        let url_future = async {
            match (&url_client, urls.is_empty()) {
                (Some(client), false) => client.check_urls(&urls).await,
                _ => Vec::new(),
            }
        };
        let file_future = async {
            match (&file_client, hashes.is_empty()) {
                (Some(client), false) => client.check_hashes(&hashes).await,
                _ => Default::default(),
            }
        };
        let (url_results, hash_severities) = tokio::join!(url_future, file_future);

        for result in url_results {
            if result.is_malicious {
                findings.push(Finding {
                    kind: FindingKind::UrlCheck,
                    rule_id: None,
                    title: "URL flagged as malicious".to_string(),
                    severity: "critical".to_string(),
                    source_file: String::new(),
                    artifact: truncate(&result.url, ARTIFACT_CAP),
                });
            }
        }
        for (hash, source) in &hash_sources {
            if hash_severities.get(hash).map(String::as_str) == Some(SEVERITY_MALWARE) {
                findings.push(Finding {
                    kind: FindingKind::FileCheck,
                    rule_id: None,
                    title: "File matches known malware".to_string(),
                    severity: "critical".to_string(),
                    source_file: source.clone(),
                    artifact: truncate(hash, ARTIFACT_CAP),
                });
            }
        }

        findings
    }
}

/// Walk a plugin root shallow-first with the skip-dir set, extension
/// filter and size cap applied. A single-file install path scans that
/// file alone. Symlinks are never followed.
fn scannable_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    let mut files: Vec<(usize, PathBuf)> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| SKIP_DIRS.contains(&name))
                    .unwrap_or(false))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| SCANNABLE_EXTS.contains(&e))
                .unwrap_or(false)
        })
        .filter(|entry| {
            entry
                .metadata()
                .map(|m| m.len() <= MAX_FILE_BYTES)
                .unwrap_or(false)
        })
        .map(|entry| (entry.depth(), entry.into_path()))
        .collect();
    files.sort();
    files.into_iter().map(|(_, path)| path).collect()
}

/// Command artifacts from a script file: one per non-blank,
/// non-comment, non-"harmless echo" line. Non-script files contribute
/// nothing.
fn script_line_artifacts(path: &Path, content: &str) -> Vec<Artifact> {
    let is_script = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SCRIPT_EXTS.contains(&e))
        .unwrap_or(false);
    if !is_script {
        return Vec::new();
    }
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !is_harmless_echo(line))
        .filter_map(Artifact::command)
        .collect()
}

/// An `echo`/`printf` line is harmless when every `|` sits inside a
/// quoted string: it prints a pipeline, it does not run one.
fn is_harmless_echo(line: &str) -> bool {
    let first_word = line.split_whitespace().next().unwrap_or("");
    if first_word != "echo" && first_word != "printf" {
        return false;
    }
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '|' if !in_single && !in_double => return false,
            _ => {}
        }
    }
    true
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
