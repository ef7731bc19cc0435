//! Persisted state stores: allowlist, verdict cache, approvals, plugin
//! scan cache. All writes go through the atomic-rename discipline in
//! [`crate::state`].

pub mod allowlist;
pub mod approvals;
pub mod scan_cache;
pub mod verdict_cache;

pub use allowlist::Allowlist;
pub use approvals::{ApprovalStore, ConsumedApproval, PendingApproval};
pub use scan_cache::PluginScanCache;
pub use verdict_cache::{CachedEntry, VerdictCache};
