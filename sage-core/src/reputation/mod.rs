//! External reputation clients: URL check, file-hash check, package
//! registries.
//!
//! Shared contract: every outbound call has a hard timeout (5s default),
//! batches where the upstream allows it, and fails open. A network
//! error, timeout or non-2xx answer produces an empty result, never an
//! error that could crash the hook.

pub mod file_check;
pub mod package_check;
pub mod registry;
pub mod url_check;

pub use file_check::{FileCheckClient, SEVERITY_MALWARE};
pub use package_check::{PackageChecker, PackageCheckResult, PackageVerdict};
pub use registry::{PackageMetadata, RegistryClient, RegistryError};
pub use url_check::{UrlCheckClient, UrlCheckResult, UrlFinding};

use std::time::Duration;

/// Bound on concurrent outbound requests within one evaluation. Large
/// install lists must not produce unbounded outstanding requests.
pub const MAX_INFLIGHT: usize = 8;

/// Build a reqwest client with the configured timeout and the Sage
/// user agent. Falls back to `None` (caller fails open) if the client
/// cannot be built.
pub(crate) fn http_client(timeout_seconds: f64) -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_seconds.max(0.1)))
        .user_agent(format!(
            "{}/{}",
            crate::PRODUCT_NAME,
            crate::PRODUCT_VERSION
        ))
        .build()
        .ok()
}
