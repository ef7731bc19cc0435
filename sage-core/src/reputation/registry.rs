//! Package registry metadata clients (npm, PyPI).
//!
//! A 404 means the package does not exist and maps to `Ok(None)`; a 5xx
//! or transport error is surfaced as `Err` so the package checker can
//! distinguish "missing" (a strong signal) from "upstream broken"
//! (fail open). Package names containing path separators or `..` are
//! rejected before any network call.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CheckConfig;
use crate::extract::packages::{PackageRef, Registry};

const NPM_BASE: &str = "https://registry.npmjs.org";
const PYPI_BASE: &str = "https://pypi.org/pypi";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry returned status {0}")]
    Upstream(reqwest::StatusCode),
}

/// What the checker needs from a registry answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    pub resolved_version: String,
    pub latest_hash: Option<String>,
    pub hash_algorithm: Option<String>,
    pub first_release_date: Option<DateTime<Utc>>,
    pub requested_version_found: bool,
}

pub struct RegistryClient {
    client: reqwest::Client,
    npm_base: String,
    pypi_base: String,
}

impl RegistryClient {
    pub fn from_config(config: &CheckConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let client = super::http_client(config.timeout_seconds)?;
        Some(Self {
            client,
            npm_base: NPM_BASE.to_string(),
            pypi_base: PYPI_BASE.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_bases(npm_base: String, pypi_base: String) -> Self {
        Self {
            client: super::http_client(1.0).expect("test client"),
            npm_base,
            pypi_base,
        }
    }

    /// Fetch registry metadata. `Ok(None)` for a missing package or a
    /// name that fails the SSRF guard.
    pub async fn fetch(
        &self,
        package: &PackageRef,
    ) -> Result<Option<PackageMetadata>, RegistryError> {
        if !name_is_safe(&package.name) {
            warn!(
                "Rejecting package name '{}' (path separators or traversal)",
                package.name
            );
            return Ok(None);
        }
        match package.registry {
            Registry::Npm => self.fetch_npm(package).await,
            Registry::Pypi => self.fetch_pypi(package).await,
        }
    }

    async fn fetch_npm(
        &self,
        package: &PackageRef,
    ) -> Result<Option<PackageMetadata>, RegistryError> {
        // Scoped names keep their `@` but the inner slash is encoded.
        let encoded = package.name.replace('/', "%2F");
        let url = format!("{}/{}", self.npm_base, encoded);
        let Some(body) = self.get_json(&url).await? else {
            return Ok(None);
        };
        let packument: NpmPackument = match serde_json::from_str(&body) {
            Ok(packument) => packument,
            Err(e) => {
                warn!("npm metadata for {} unparseable: {e}", package.name);
                return Ok(None);
            }
        };

        let latest = packument
            .dist_tags
            .get("latest")
            .cloned()
            .unwrap_or_default();
        let dist = packument.versions.get(&latest).and_then(|v| v.dist.as_ref());
        let (latest_hash, hash_algorithm) = match dist {
            Some(dist) => match &dist.integrity {
                Some(integrity) => match integrity.split_once('-') {
                    Some((algorithm, hash)) => {
                        (Some(hash.to_string()), Some(algorithm.to_string()))
                    }
                    None => (Some(integrity.clone()), None),
                },
                None => (dist.shasum.clone(), dist.shasum.as_ref().map(|_| "sha1".to_string())),
            },
            None => (None, None),
        };

        let first_release_date = packument
            .time
            .get("created")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        let requested_version_found = match &package.version {
            Some(version) => packument.versions.contains_key(version),
            None => true,
        };

        Ok(Some(PackageMetadata {
            resolved_version: latest,
            latest_hash,
            hash_algorithm,
            first_release_date,
            requested_version_found,
        }))
    }

    async fn fetch_pypi(
        &self,
        package: &PackageRef,
    ) -> Result<Option<PackageMetadata>, RegistryError> {
        let url = format!("{}/{}/json", self.pypi_base, package.name);
        let Some(body) = self.get_json(&url).await? else {
            return Ok(None);
        };
        let response: PypiResponse = match serde_json::from_str(&body) {
            Ok(response) => response,
            Err(e) => {
                warn!("PyPI metadata for {} unparseable: {e}", package.name);
                return Ok(None);
            }
        };

        let latest_hash = response
            .urls
            .iter()
            .find_map(|f| f.digests.get("sha256").cloned());

        let first_release_date = response
            .releases
            .values()
            .flatten()
            .filter_map(|f| f.upload_time_iso_8601)
            .min();

        let requested_version_found = match &package.version {
            Some(version) => response.releases.contains_key(version),
            None => true,
        };

        let hash_algorithm = latest_hash_algorithm(&response);

        Ok(Some(PackageMetadata {
            resolved_version: response.info.version,
            latest_hash,
            hash_algorithm,
            first_release_date,
            requested_version_found,
        }))
    }

    /// GET returning the body text; `Ok(None)` on 404, `Err` on other
    /// non-2xx statuses.
    async fn get_json(&self, url: &str) -> Result<Option<String>, RegistryError> {
        debug!("Registry fetch: {url}");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RegistryError::Upstream(status));
        }
        Ok(Some(response.text().await?))
    }
}

fn latest_hash_algorithm(response: &PypiResponse) -> Option<String> {
    response
        .urls
        .iter()
        .any(|f| f.digests.contains_key("sha256"))
        .then(|| "sha256".to_string())
}

/// SSRF guard: a package name must not steer the request path.
fn name_is_safe(name: &str) -> bool {
    if name.contains("..") || name.contains('\\') {
        return false;
    }
    // One slash is allowed, and only as a scope separator.
    match name.matches('/').count() {
        0 => true,
        1 => name.starts_with('@'),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct NpmPackument {
    #[serde(default, rename = "dist-tags")]
    dist_tags: HashMap<String, String>,
    #[serde(default)]
    versions: HashMap<String, NpmVersion>,
    #[serde(default)]
    time: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NpmVersion {
    dist: Option<NpmDist>,
}

#[derive(Debug, Deserialize)]
struct NpmDist {
    integrity: Option<String>,
    shasum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PypiResponse {
    info: PypiInfo,
    #[serde(default)]
    releases: HashMap<String, Vec<PypiFile>>,
    #[serde(default)]
    urls: Vec<PypiFile>,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct PypiFile {
    #[serde(default)]
    digests: HashMap<String, String>,
    upload_time_iso_8601: Option<DateTime<Utc>>,
}
