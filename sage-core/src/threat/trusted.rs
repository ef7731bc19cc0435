//! Trusted-domain registry.
//!
//! A registry domain matches a host by case-insensitive exact or
//! dot-suffix comparison: `bun.sh` trusts `bun.sh` and `*.bun.sh` but
//! not `evilbun.sh`.

use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedDomain {
    pub domain: String,
    #[serde(default)]
    pub reason: String,
}

/// A trusted-domain file is a bare list or wrapped in a `domains:` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrustedFile {
    Wrapped { domains: Vec<TrustedDomain> },
    Bare(Vec<TrustedDomain>),
}

#[derive(Debug, Default, Clone)]
pub struct TrustedDomains {
    domains: Vec<TrustedDomain>,
}

impl TrustedDomains {
    pub fn new(domains: Vec<TrustedDomain>) -> Self {
        Self { domains }
    }

    /// Load every `*.yml` / `*.yaml` file in `dir`. Unreadable files and
    /// a missing directory yield an empty (trust-nothing) registry.
    pub fn load(dir: &Path) -> Self {
        let mut domains = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Trusted-domain dir {} unreadable: {e}", dir.display());
                return Self::default();
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
                    warn!("Skipping unreadable trusted file {}: {e}", path.display());
                    continue;
                }
            };
            match serde_yaml_ng::from_str::<TrustedFile>(&content) {
                Ok(TrustedFile::Wrapped { domains: parsed })
                | Ok(TrustedFile::Bare(parsed)) => domains.extend(parsed),
                Err(e) => {
                    warn!("Skipping malformed trusted file {}: {e}", path.display());
                }
            }
        }

        debug!("Loaded {} trusted domains", domains.len());
        Self { domains }
    }

    /// Whether `host` is covered by any registered domain suffix.
    pub fn is_trusted(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.domains.iter().any(|entry| {
            let domain = entry.domain.to_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }

    /// Whether `url` parses and its host is trusted.
    pub fn is_trusted_url(&self, url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|host| self.is_trusted(host)))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
