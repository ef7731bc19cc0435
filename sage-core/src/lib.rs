//! Sage - Agent Detection & Response for AI coding assistants.
//!
//! Host agents hand Sage a tool-call payload before executing it; Sage
//! extracts artifacts (commands, URLs, file paths, content), runs them
//! through heuristic rules, allowlists, caches and external reputation,
//! and returns an `allow` / `ask` / `deny` verdict. Every I/O boundary is
//! fail-open: Sage must never crash the host agent.

pub mod artifact;
pub mod audit;
pub mod config;
pub mod engine;
pub mod extract;
pub mod harness;
pub mod normalize;
pub mod plugin_scan;
pub mod reputation;
pub mod state;
pub mod store;
pub mod threat;

pub use artifact::{Artifact, ArtifactKind};
pub use config::Config;
pub use engine::decision::{Decision, Sensitivity, Verdict, VerdictSeverity};
pub use engine::{EvalRequest, Evaluator, SagePaths};

/// Product name sent to reputation upstreams.
pub const PRODUCT_NAME: &str = "sage";

/// Crate version sent to reputation upstreams.
pub const PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");
