//! Threat rule corpus: YAML loading, regex compilation, lifecycle filters.
//!
//! Rules live as YAML files in a directory and are loaded once per
//! evaluator invocation. Loading is forgiving: a rule with an invalid
//! regex is dropped with a warning, an unreadable file contributes
//! nothing, and an unreadable directory yields an empty rule set. The
//! heuristic layer degrades rather than aborts.

pub mod trusted;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::artifact::ArtifactKind;

/// Severity assigned by a rule author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl ThreatSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatSeverity::Critical => "critical",
            ThreatSeverity::High => "high",
            ThreatSeverity::Medium => "medium",
            ThreatSeverity::Low => "low",
        }
    }
}

/// What a rule hit should do to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    RequireApproval,
    Log,
}

/// A compiled, immutable threat rule.
#[derive(Debug)]
pub struct ThreatRule {
    pub id: String,
    pub category: String,
    pub severity: ThreatSeverity,
    pub confidence: f64,
    pub action: RuleAction,
    pub pattern: Regex,
    pub match_on: Vec<ArtifactKind>,
    pub title: String,
}

/// `match_on` accepts a single kind or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MatchOnSpec {
    One(String),
    Many(Vec<String>),
}

impl MatchOnSpec {
    fn kinds(&self) -> Vec<ArtifactKind> {
        let names: Vec<&str> = match self {
            MatchOnSpec::One(name) => vec![name.as_str()],
            MatchOnSpec::Many(names) => names.iter().map(String::as_str).collect(),
        };
        names
            .into_iter()
            .filter_map(|name| match name {
                "command" => Some(ArtifactKind::Command),
                // `domain` rules run against URL artifacts.
                "url" | "domain" => Some(ArtifactKind::Url),
                "content" => Some(ArtifactKind::Content),
                "file_path" => Some(ArtifactKind::FilePath),
                other => {
                    warn!("Unknown match_on kind '{other}', ignoring");
                    None
                }
            })
            .collect()
    }
}

/// On-disk rule shape before regex compilation.
#[derive(Debug, Deserialize)]
struct ThreatRuleSpec {
    id: String,
    category: String,
    severity: ThreatSeverity,
    confidence: f64,
    action: RuleAction,
    pattern: String,
    match_on: MatchOnSpec,
    title: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    revoked: bool,
}

/// A threat file is either a bare list or wrapped in a `threats:` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ThreatFile {
    Wrapped { threats: Vec<ThreatRuleSpec> },
    Bare(Vec<ThreatRuleSpec>),
}

impl ThreatFile {
    fn into_specs(self) -> Vec<ThreatRuleSpec> {
        match self {
            ThreatFile::Wrapped { threats } => threats,
            ThreatFile::Bare(specs) => specs,
        }
    }
}

/// Load every rule from `*.yml` / `*.yaml` files in `dir`, dropping
/// expired, revoked, disabled and uncompilable rules.
pub fn load_threats(dir: &Path, disabled: &[String]) -> Vec<Arc<ThreatRule>> {
    let now = Utc::now();
    let mut rules = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Threat directory {} unreadable: {e}", dir.display());
            return rules;
        }
    };

    let mut paths: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yml" || e == "yaml")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping unreadable threat file {}: {e}", path.display());
                continue;
            }
        };
        let specs = match serde_yaml_ng::from_str::<ThreatFile>(&content) {
            Ok(file) => file.into_specs(),
            Err(e) => {
                warn!("Skipping malformed threat file {}: {e}", path.display());
                continue;
            }
        };

        for spec in specs {
            if spec.revoked {
                debug!("Dropping revoked rule {}", spec.id);
                continue;
            }
            if let Some(expires_at) = spec.expires_at {
                if expires_at <= now {
                    debug!("Dropping expired rule {}", spec.id);
                    continue;
                }
            }
            if disabled.iter().any(|id| id == &spec.id) {
                debug!("Dropping disabled rule {}", spec.id);
                continue;
            }
            let pattern = match Regex::new(&spec.pattern) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!("Dropping rule {} with invalid regex: {e}", spec.id);
                    continue;
                }
            };
            let match_on = spec.match_on.kinds();
            if match_on.is_empty() {
                warn!("Dropping rule {} with no usable match_on", spec.id);
                continue;
            }
            rules.push(Arc::new(ThreatRule {
                id: spec.id,
                category: spec.category,
                severity: spec.severity,
                confidence: spec.confidence.clamp(0.0, 1.0),
                action: spec.action,
                pattern,
                match_on,
                title: spec.title,
            }));
        }
    }

    debug!("Loaded {} threat rules from {}", rules.len(), dir.display());
    rules
}
