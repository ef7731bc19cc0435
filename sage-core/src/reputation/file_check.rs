//! Batched file-hash reputation lookups.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::config::CheckConfig;

const DEFAULT_ENDPOINT: &str = "https://reputation.sage-adr.dev/v1/files";

/// Severity name that drives a critical finding.
pub const SEVERITY_MALWARE: &str = "SEVERITY_MALWARE";

#[derive(Debug, Serialize)]
struct FileCheckRequest<'a> {
    product: Product,
    hashes: &'a [String],
}

#[derive(Debug, Serialize)]
struct Product {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct FileCheckResponse {
    #[serde(default)]
    results: Vec<HashResult>,
}

#[derive(Debug, Deserialize)]
struct HashResult {
    hash: String,
    #[serde(default)]
    severity: String,
}

/// File-hash reputation client.
pub struct FileCheckClient {
    client: reqwest::Client,
    endpoint: String,
}

impl FileCheckClient {
    /// `None` when disabled or the client cannot be built (fail-open).
    pub fn from_config(config: &CheckConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let client = super::http_client(config.timeout_seconds)?;
        Some(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        })
    }

    /// Look up a set of hashes; returns hash → severity name. Empty on
    /// any failure.
    pub async fn check_hashes(&self, hashes: &[String]) -> HashMap<String, String> {
        if hashes.is_empty() {
            return HashMap::new();
        }
        let request = FileCheckRequest {
            product: Product {
                name: crate::PRODUCT_NAME,
                version: crate::PRODUCT_VERSION,
            },
            hashes,
        };
        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("File check request failed (continuing without): {e}");
                return HashMap::new();
            }
        };
        if !response.status().is_success() {
            warn!(
                "File check returned {} (continuing without)",
                response.status()
            );
            return HashMap::new();
        }
        match response.json::<FileCheckResponse>().await {
            Ok(parsed) => parsed
                .results
                .into_iter()
                .map(|r| (r.hash, r.severity))
                .collect(),
            Err(e) => {
                warn!("File check response unparseable (continuing without): {e}");
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parse() {
        let parsed: FileCheckResponse = serde_json::from_str(
            r#"{"results": [{"hash": "abc", "severity": "SEVERITY_MALWARE"},
                            {"hash": "def"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].severity, SEVERITY_MALWARE);
        assert_eq!(parsed.results[1].severity, "");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_open() {
        let config = CheckConfig {
            enabled: true,
            timeout_seconds: 0.2,
            endpoint: Some("http://127.0.0.1:9/unroutable".to_string()),
        };
        let client = FileCheckClient::from_config(&config).unwrap();
        let results = client.check_hashes(&["deadbeef".to_string()]).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_no_request() {
        let client = FileCheckClient::from_config(&CheckConfig::default()).unwrap();
        assert!(client.check_hashes(&[]).await.is_empty());
    }
}
