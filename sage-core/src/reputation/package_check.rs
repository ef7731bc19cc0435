//! Package scoring: registry metadata plus optional file-hash check.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use chrono::Utc;
use tracing::{debug, warn};

use crate::extract::packages::{PackageRef, Registry};

use super::file_check::{FileCheckClient, SEVERITY_MALWARE};
use super::registry::RegistryClient;
use super::MAX_INFLIGHT;

/// Packages younger than this are flagged for re-review.
pub const FRESHNESS_WINDOW_DAYS: i64 = 7;

/// Outcome of checking one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageVerdict {
    Clean,
    NotFound,
    SuspiciousAge,
    Malicious,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PackageCheckResult {
    pub name: String,
    pub registry: Registry,
    pub verdict: PackageVerdict,
    pub confidence: f64,
    pub details: String,
    pub age_days: Option<i64>,
}

impl PackageCheckResult {
    /// Cache key matching the package that produced this result.
    pub fn cache_key(&self, version: Option<&str>) -> String {
        match version {
            Some(version) => format!("{}:{}@{}", self.registry, self.name, version),
            None => format!("{}:{}", self.registry, self.name),
        }
    }
}

/// Scores parsed packages against registry metadata and the file check.
pub struct PackageChecker {
    registry: RegistryClient,
    file_check: Option<FileCheckClient>,
}

impl PackageChecker {
    pub fn new(registry: RegistryClient, file_check: Option<FileCheckClient>) -> Self {
        Self {
            registry,
            file_check,
        }
    }

    /// Check packages with bounded parallelism. Results come back in no
    /// particular order; callers key them by name.
    pub async fn check_packages(
        self: Arc<Self>,
        packages: Vec<PackageRef>,
    ) -> Vec<PackageCheckResult> {
        if packages.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(MAX_INFLIGHT));
        let mut tasks = JoinSet::new();
        for package in packages {
            let checker = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                Some(checker.check_one(&package).await)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(result)) = joined {
                results.push(result);
            }
        }
        results
    }

    async fn check_one(&self, package: &PackageRef) -> PackageCheckResult {
        let metadata = match self.registry.fetch(package).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                return PackageCheckResult {
                    name: package.name.clone(),
                    registry: package.registry,
                    verdict: PackageVerdict::NotFound,
                    confidence: 0.95,
                    details: format!(
                        "Package '{}' does not exist on {}",
                        package.name, package.registry
                    ),
                    age_days: None,
                };
            }
            Err(e) => {
                // Upstream broken, not package missing: fail open.
                warn!("Registry check for {} failed open: {e}", package.name);
                return PackageCheckResult {
                    name: package.name.clone(),
                    registry: package.registry,
                    verdict: PackageVerdict::Unknown,
                    confidence: 0.0,
                    details: format!("Registry unavailable: {e}"),
                    age_days: None,
                };
            }
        };

        let age_days = metadata
            .first_release_date
            .map(|first| (Utc::now() - first).num_days());

        // File-hash reputation on the latest artifact, when available.
        if let (Some(file_check), Some(hash)) = (&self.file_check, &metadata.latest_hash) {
            let severities = file_check.check_hashes(std::slice::from_ref(hash)).await;
            if severities.get(hash).map(String::as_str) == Some(SEVERITY_MALWARE) {
                return PackageCheckResult {
                    name: package.name.clone(),
                    registry: package.registry,
                    verdict: PackageVerdict::Malicious,
                    confidence: 0.95,
                    details: format!(
                        "Published artifact of '{}' is known malware",
                        package.name
                    ),
                    age_days,
                };
            }
        }

        if let Some(age) = age_days {
            if age < FRESHNESS_WINDOW_DAYS {
                debug!("Package {} is {age} days old", package.name);
                return PackageCheckResult {
                    name: package.name.clone(),
                    registry: package.registry,
                    verdict: PackageVerdict::SuspiciousAge,
                    confidence: 0.6,
                    details: format!(
                        "Package '{}' was first published {age} day(s) ago",
                        package.name
                    ),
                    age_days,
                };
            }
        }

        PackageCheckResult {
            name: package.name.clone(),
            registry: package.registry,
            verdict: PackageVerdict::Clean,
            confidence: 0.8,
            details: format!(
                "Package '{}' resolves to {}",
                package.name, metadata.resolved_version
            ),
            age_days,
        }
    }
}
