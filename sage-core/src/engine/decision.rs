//! Verdict types and the signal-fusion decision table.
//!
//! All signals (heuristic matches, URL reputation, package reputation)
//! reduce to a single verdict under the active sensitivity preset.
//! Strongest decision wins (`deny > ask > allow`); the verdict's detail
//! fields come from the signal that produced the strongest decision,
//! first in input order on ties.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::artifact::Artifact;
use crate::reputation::{PackageCheckResult, PackageVerdict, UrlCheckResult};
use crate::threat::RuleAction;

use super::heuristics::HeuristicMatch;

/// The pipeline's output decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Ask => "ask",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict-level severity, distinct from rule severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSeverity {
    Info,
    Warning,
    Critical,
}

/// How aggressively warning-level signals are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Paranoid,
    Balanced,
    Relaxed,
}

/// The evaluation pipeline's result for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub category: String,
    pub confidence: f64,
    pub severity: VerdictSeverity,
    pub source: String,
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_threat_id: Option<String>,
    pub reasons: Vec<String>,
}

impl Verdict {
    /// An allow verdict carries no user-visible detail.
    pub fn allow(source: &str) -> Self {
        Self {
            decision: Decision::Allow,
            category: "none".to_string(),
            confidence: 1.0,
            severity: VerdictSeverity::Info,
            source: source.to_string(),
            artifacts: Vec::new(),
            matched_threat_id: None,
            reasons: Vec::new(),
        }
    }
}

/// One scored signal, before fusion.
struct Signal {
    decision: Decision,
    category: String,
    confidence: f64,
    severity: VerdictSeverity,
    source: String,
    artifacts: Vec<Artifact>,
    matched_threat_id: Option<String>,
    reason: String,
}

/// Fuse all gathered signals into a verdict.
pub fn decide(
    matches: &[HeuristicMatch],
    url_results: &[UrlCheckResult],
    package_results: &[PackageCheckResult],
    sensitivity: Sensitivity,
) -> Verdict {
    let mut signals = Vec::new();

    for hit in matches {
        signals.push(heuristic_signal(hit, sensitivity));
    }
    for result in url_results {
        if let Some(signal) = url_signal(result, sensitivity) {
            signals.push(signal);
        }
    }
    for result in package_results {
        if let Some(signal) = package_signal(result, sensitivity) {
            signals.push(signal);
        }
    }

    let Some(strongest) = signals
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            // Stable: on equal decisions the earlier signal wins.
            a.decision.cmp(&b.decision).then(ib.cmp(ia))
        })
        .map(|(i, _)| i)
    else {
        return Verdict::allow("no_signals");
    };

    let decision = signals[strongest].decision;
    if decision == Decision::Allow {
        // Only weak signals; an allow verdict exposes nothing.
        return Verdict::allow(&signals[strongest].source);
    }

    let confidence = signals
        .iter()
        .filter(|s| s.decision == decision)
        .map(|s| s.confidence)
        .fold(0.0_f64, f64::max);

    let top = &signals[strongest];
    Verdict {
        decision,
        category: top.category.clone(),
        confidence,
        severity: top.severity,
        source: top.source.clone(),
        artifacts: top.artifacts.clone(),
        matched_threat_id: top.matched_threat_id.clone(),
        reasons: vec![top.reason.clone()],
    }
}

fn heuristic_signal(hit: &HeuristicMatch, sensitivity: Sensitivity) -> Signal {
    let decision = match hit.rule.action {
        RuleAction::Block => Decision::Deny,
        RuleAction::RequireApproval => Decision::Ask,
        RuleAction::Log => match sensitivity {
            Sensitivity::Paranoid => Decision::Ask,
            Sensitivity::Balanced | Sensitivity::Relaxed => Decision::Allow,
        },
    };
    let severity = match hit.rule.action {
        RuleAction::Block => VerdictSeverity::Critical,
        RuleAction::RequireApproval => VerdictSeverity::Warning,
        RuleAction::Log => VerdictSeverity::Info,
    };
    Signal {
        decision,
        category: hit.rule.category.clone(),
        confidence: hit.rule.confidence,
        severity,
        source: "heuristics".to_string(),
        artifacts: Artifact::new(hit.artifact_kind, hit.artifact_value.clone())
            .map(|a| vec![a])
            .unwrap_or_default(),
        matched_threat_id: Some(hit.rule.id.clone()),
        reason: format!("{} [{}]", hit.rule.title, hit.rule.id),
    }
}

fn url_signal(result: &UrlCheckResult, sensitivity: Sensitivity) -> Option<Signal> {
    if result.is_malicious {
        let finding = result
            .findings
            .first()
            .map(|f| f.finding_type.clone())
            .unwrap_or_else(|| "malicious".to_string());
        return Some(Signal {
            decision: Decision::Deny,
            category: "malicious_url".to_string(),
            confidence: 0.95,
            severity: VerdictSeverity::Critical,
            source: "url_check".to_string(),
            artifacts: Artifact::url(result.url.clone())
                .map(|a| vec![a])
                .unwrap_or_default(),
            matched_threat_id: None,
            reason: format!("URL flagged as malicious ({finding}): {}", result.url),
        });
    }
    if !result.flags.is_empty() {
        let decision = match sensitivity {
            Sensitivity::Paranoid | Sensitivity::Balanced => Decision::Ask,
            Sensitivity::Relaxed => Decision::Allow,
        };
        return Some(Signal {
            decision,
            category: "suspicious_url".to_string(),
            confidence: 0.6,
            severity: VerdictSeverity::Warning,
            source: "url_check".to_string(),
            artifacts: Artifact::url(result.url.clone())
                .map(|a| vec![a])
                .unwrap_or_default(),
            matched_threat_id: None,
            reason: format!(
                "URL carries reputation flags [{}]: {}",
                result.flags.join(", "),
                result.url
            ),
        });
    }
    None
}

fn package_signal(result: &PackageCheckResult, sensitivity: Sensitivity) -> Option<Signal> {
    let (decision, severity, category) = match result.verdict {
        PackageVerdict::NotFound => (
            Decision::Deny,
            VerdictSeverity::Critical,
            "package_not_found",
        ),
        PackageVerdict::Malicious => {
            (Decision::Deny, VerdictSeverity::Critical, "package_malware")
        }
        PackageVerdict::SuspiciousAge => {
            let decision = match sensitivity {
                Sensitivity::Paranoid | Sensitivity::Balanced => Decision::Ask,
                Sensitivity::Relaxed => Decision::Allow,
            };
            (decision, VerdictSeverity::Warning, "package_freshness")
        }
        PackageVerdict::Clean | PackageVerdict::Unknown => return None,
    };
    Some(Signal {
        decision,
        category: category.to_string(),
        confidence: result.confidence,
        severity,
        source: "package_check".to_string(),
        artifacts: Artifact::command(format!("{} install {}", result.registry, result.name))
            .map(|a| vec![a])
            .unwrap_or_default(),
        matched_threat_id: None,
        reason: result.details.clone(),
    })
}
