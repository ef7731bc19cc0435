//! The evaluation pipeline: one tool call in, one verdict out.
//!
//! Orchestrates extraction, allowlist short-circuit, verdict cache,
//! heuristics, reputation and decision fusion. Each hook invocation is
//! a fresh, short-lived pipeline: config, threats, allowlist and caches
//! are loaded per call and persisted before the verdict is returned.
//! Every failure inside the pipeline degrades to a safe default rather
//! than surfacing to the host.

pub mod decision;
pub mod heuristics;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactKind};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::extract::packages::{extract_packages, PackageRef};
use crate::extract::extract_artifacts;
use crate::reputation::{
    FileCheckClient, PackageCheckResult, PackageChecker, PackageVerdict, RegistryClient,
    UrlCheckClient, UrlCheckResult,
};
use crate::state;
use crate::store::verdict_cache::CachedEntry;
use crate::store::{Allowlist, VerdictCache};
use crate::threat::trusted::TrustedDomains;
use crate::threat::load_threats;

use decision::{decide, Decision, Sensitivity, Verdict, VerdictSeverity};
use heuristics::{HeuristicMatch, HeuristicsEngine};

/// Where Sage keeps its state. Everything hangs off one directory so
/// tests can point the whole pipeline at a scratch dir.
#[derive(Debug, Clone)]
pub struct SagePaths {
    pub state_dir: PathBuf,
}

impl SagePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(state::CONFIG_FILE)
    }

    pub fn threats_dir(&self) -> PathBuf {
        self.state_dir.join(state::THREATS_DIR)
    }

    pub fn trusted_dir(&self) -> PathBuf {
        self.state_dir.join(state::TRUSTED_DIR)
    }

    pub fn plugin_scan_cache_path(&self) -> PathBuf {
        self.state_dir.join(state::PLUGIN_SCAN_CACHE_FILE)
    }
}

impl Default for SagePaths {
    fn default() -> Self {
        Self::new(state::default_state_dir())
    }
}

/// One hook call as the adapter hands it over.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

/// The evaluation pipeline.
pub struct Evaluator {
    paths: SagePaths,
}

impl Evaluator {
    pub fn new(paths: SagePaths) -> Self {
        Self { paths }
    }

    /// Evaluate one tool call. Never fails: any internal error yields
    /// an allow verdict, per the fail-open contract.
    pub async fn evaluate(&self, request: &EvalRequest) -> Verdict {
        match self.evaluate_inner(request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Evaluation failed open: {e:#}");
                Verdict::allow("error")
            }
        }
    }

    async fn evaluate_inner(&self, request: &EvalRequest) -> anyhow::Result<Verdict> {
        let config = Config::load(&self.paths.config_path());
        let sensitivity = config.sensitivity;
        let audit = AuditLog::new(&config.logging, &config.audit_path(&self.paths.state_dir));

        let artifacts = extract_artifacts(&request.tool_name, &request.tool_input);
        if artifacts.is_empty() {
            debug!("No artifacts for tool '{}'", request.tool_name);
            // Unknown or empty tools degrade to allow; paranoid asks.
            if sensitivity == Sensitivity::Paranoid {
                let verdict = Verdict {
                    decision: Decision::Ask,
                    category: "unmapped_tool".to_string(),
                    confidence: 0.3,
                    severity: VerdictSeverity::Warning,
                    source: "no_artifacts".to_string(),
                    artifacts: Vec::new(),
                    matched_threat_id: None,
                    reasons: vec![format!(
                        "No artifacts could be extracted from tool '{}'",
                        request.tool_name
                    )],
                };
                return Ok(verdict);
            }
            return Ok(Verdict::allow("no_artifacts"));
        }

        // User allowlist short-circuit, under the anti-smuggling rule.
        let allowlist = Allowlist::load(&config.allowlist_path(&self.paths.state_dir));
        if allowlist.is_allowlisted(&artifacts) {
            info!("Allowlisted; skipping evaluation");
            let verdict = Verdict::allow("allowlisted");
            audit.log_verdict(
                request.session_id.as_deref(),
                &request.tool_name,
                &request.tool_input,
                &verdict,
                true,
            );
            return Ok(verdict);
        }

        let mut cache = VerdictCache::open(
            &config.cache,
            &config.cache_path(&self.paths.state_dir),
        );

        // Partition URL artifacts into cached and uncached.
        let mut cached_urls: Vec<(String, CachedEntry)> = Vec::new();
        let mut uncached_urls: Vec<String> = Vec::new();
        for artifact in artifacts.iter().filter(|a| a.kind == ArtifactKind::Url) {
            match cache.get_url(&artifact.value) {
                Some(entry) => cached_urls.push((artifact.value.clone(), entry)),
                None => uncached_urls.push(artifact.value.clone()),
            }
        }

        // Heuristics are synchronous; reputation runs while they do not.
        let matches: Vec<HeuristicMatch> = if config.heuristics_enabled {
            let rules = load_threats(&self.paths.threats_dir(), &config.disabled_threats);
            let trusted = TrustedDomains::load(&self.paths.trusted_dir());
            HeuristicsEngine::new(rules, trusted).matches(&artifacts)
        } else {
            Vec::new()
        };

        // Package pipeline applies to tools that can install or declare
        // packages.
        let package_tool = matches!(request.tool_name.as_str(), "Bash" | "Write" | "Edit");
        let packages = if config.package_check.enabled && package_tool {
            extract_packages(&request.tool_name, &request.tool_input)
        } else {
            Vec::new()
        };
        let mut cached_packages: Vec<(String, CachedEntry)> = Vec::new();
        let mut uncached_packages: Vec<PackageRef> = Vec::new();
        for package in packages {
            match cache.get_package(&package.cache_key()) {
                Some(entry) if entry.verdict != Decision::Allow => {
                    cached_packages.push((package.cache_key(), entry));
                }
                Some(_) => {}
                None => uncached_packages.push(package),
            }
        }
        let package_versions: HashMap<String, Option<String>> = uncached_packages
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();

        // Reputation lookups run concurrently, each failing open.
        let url_client = UrlCheckClient::from_config(&config.url_check);
        let url_future = async {
            match (&url_client, uncached_urls.is_empty()) {
                (Some(client), false) => client.check_urls(&uncached_urls).await,
                _ => Vec::new(),
            }
        };
        let checker = RegistryClient::from_config(&config.package_check).map(|registry| {
            Arc::new(PackageChecker::new(
                registry,
                FileCheckClient::from_config(&config.file_check),
            ))
        });
        let package_future = async {
            match (checker, uncached_packages.is_empty()) {
                (Some(checker), false) => checker.check_packages(uncached_packages).await,
                _ => Vec::new(),
            }
        };
        let (url_results, package_results): (Vec<UrlCheckResult>, Vec<PackageCheckResult>) =
            tokio::join!(url_future, package_future);

        let mut verdict = decide(&matches, &url_results, &package_results, sensitivity);

        // A cached non-allow reputation verdict survives even when
        // reputation was not re-queried this call.
        if verdict.decision == Decision::Allow {
            let promoted = cached_urls
                .iter()
                .find(|(_, entry)| entry.verdict != Decision::Allow)
                .map(|(url, entry)| promote_cached(url, ArtifactKind::Url, entry))
                .or_else(|| {
                    cached_packages
                        .first()
                        .map(|(key, entry)| promote_cached(key, ArtifactKind::Command, entry))
                });
            if let Some(promoted) = promoted {
                debug!("Promoting cached non-allow verdict");
                verdict = promoted;
            }
        }

        // Persist fresh reputation outcomes. URL entries come only from
        // the URL-check client: a heuristic deny against a co-present
        // command must not poison the URL cache.
        for result in &url_results {
            let (entry_decision, reasons) = if result.is_malicious {
                (
                    Decision::Deny,
                    vec![format!("URL flagged as malicious: {}", result.url)],
                )
            } else if !result.flags.is_empty() {
                (
                    Decision::Ask,
                    vec![format!(
                        "URL carries reputation flags [{}]",
                        result.flags.join(", ")
                    )],
                )
            } else {
                (Decision::Allow, Vec::new())
            };
            cache.put_url(&result.url, entry_decision, result.is_malicious, reasons);
        }
        for result in &package_results {
            let (entry_decision, severity) = match result.verdict {
                PackageVerdict::NotFound | PackageVerdict::Malicious => {
                    (Decision::Deny, VerdictSeverity::Critical)
                }
                PackageVerdict::SuspiciousAge => match sensitivity {
                    Sensitivity::Relaxed => (Decision::Allow, VerdictSeverity::Warning),
                    _ => (Decision::Ask, VerdictSeverity::Warning),
                },
                PackageVerdict::Clean => (Decision::Allow, VerdictSeverity::Info),
                // Upstream failure is not a verdict; do not cache it.
                PackageVerdict::Unknown => continue,
            };
            let version = package_versions.get(&result.name).cloned().flatten();
            cache.put_package(
                &result.cache_key(version.as_deref()),
                entry_decision,
                severity,
                vec![result.details.clone()],
                result.age_days,
            );
        }
        cache.save();

        audit.log_verdict(
            request.session_id.as_deref(),
            &request.tool_name,
            &request.tool_input,
            &verdict,
            false,
        );

        Ok(verdict)
    }
}

/// Rebuild a verdict from a cached entry.
fn promote_cached(key: &str, kind: ArtifactKind, entry: &CachedEntry) -> Verdict {
    Verdict {
        decision: entry.verdict,
        category: "cached_reputation".to_string(),
        confidence: 0.9,
        severity: entry.severity,
        source: entry.source.clone(),
        artifacts: Artifact::new(kind, key.to_string())
            .map(|a| vec![a])
            .unwrap_or_default(),
        matched_threat_id: None,
        reasons: entry.reasons.clone(),
    }
}
