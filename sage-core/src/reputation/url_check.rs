//! Batched URL reputation lookups.

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::CheckConfig;

use super::MAX_INFLIGHT;

const DEFAULT_ENDPOINT: &str = "https://reputation.sage-adr.dev/v1/urls";

/// Upstream batch limit.
const BATCH_SIZE: usize = 50;

/// One URL's reputation answer.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlCheckResult {
    pub url: String,
    pub is_malicious: bool,
    pub findings: Vec<UrlFinding>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UrlFinding {
    #[serde(default)]
    pub severity: String,
    #[serde(default, rename = "type")]
    pub finding_type: String,
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    product: ProductTag,
    keys: &'a [String],
}

#[derive(Debug, Serialize)]
struct ProductTag {
    name: &'static str,
    version: &'static str,
}

impl ProductTag {
    fn current() -> Self {
        Self {
            name: crate::PRODUCT_NAME,
            version: crate::PRODUCT_VERSION,
        }
    }
}

// The answer envelope nests the verdict several levels deep; every
// level is optional so partial answers parse instead of failing the
// whole batch.
#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    answers: Vec<Answer>,
}

#[derive(Debug, Deserialize)]
struct Answer {
    #[serde(default)]
    key: String,
    result: Option<AnswerResult>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnswerResult {
    success: Option<Success>,
}

#[derive(Debug, Deserialize)]
struct Success {
    classification: Option<Classification>,
}

#[derive(Debug, Deserialize)]
struct Classification {
    result: Option<ClassificationResult>,
}

#[derive(Debug, Deserialize)]
struct ClassificationResult {
    malicious: Option<Malicious>,
}

#[derive(Debug, Deserialize)]
struct Malicious {
    #[serde(default)]
    findings: Vec<UrlFinding>,
}

/// URL reputation client. `None` endpoint uses the default upstream.
pub struct UrlCheckClient {
    client: reqwest::Client,
    endpoint: String,
}

impl UrlCheckClient {
    /// Returns `None` when the check is disabled or the HTTP client
    /// cannot be constructed (fail-open).
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

    /// Check a set of URLs in batches of at most 50, batches in
    /// parallel. Any batch that fails contributes nothing.
    pub async fn check_urls(&self, urls: &[String]) -> Vec<UrlCheckResult> {
        if urls.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(MAX_INFLIGHT));
        let mut tasks = JoinSet::new();
        for batch in urls.chunks(BATCH_SIZE) {
            let batch = batch.to_vec();
            let client = self.client.clone();
            let endpoint = self.endpoint.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                check_batch(&client, &endpoint, &batch).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(batch_results)) = joined {
                results.extend(batch_results);
            }
        }
        results
    }
}

async fn check_batch(
    client: &reqwest::Client,
    endpoint: &str,
    batch: &[String],
) -> Option<Vec<UrlCheckResult>> {
    let request = CheckRequest {
        product: ProductTag::current(),
        keys: batch,
    };
    let response = match client.post(endpoint).json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("URL check request failed (continuing without): {e}");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(
            "URL check returned {} (continuing without)",
            response.status()
        );
        return None;
    }
    let parsed: CheckResponse = match response.json().await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("URL check response unparseable (continuing without): {e}");
            return None;
        }
    };

    debug!("URL check answered {} keys", parsed.answers.len());
    Some(parsed.answers.into_iter().map(answer_to_result).collect())
}

fn answer_to_result(answer: Answer) -> UrlCheckResult {
    let malicious = answer
        .result
        .as_ref()
        .and_then(|r| r.success.as_ref())
        .and_then(|s| s.classification.as_ref())
        .and_then(|c| c.result.as_ref())
        .and_then(|r| r.malicious.as_ref());

    UrlCheckResult {
        url: answer.key.clone(),
        is_malicious: malicious.is_some(),
        findings: malicious.map(|m| m.findings.clone()).unwrap_or_default(),
        flags: answer.flags,
    }
}
