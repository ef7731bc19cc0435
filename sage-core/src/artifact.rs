//! Artifact types extracted from tool-call payloads.
//!
//! An artifact is a typed string pulled out of a tool input: the command
//! of a Bash call, a URL mentioned anywhere, a file path being written,
//! or file content. Artifacts are the common currency between the
//! extractors, the heuristics engine and the allowlist.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a single extracted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Url,
    Command,
    FilePath,
    Content,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Url => "url",
            ArtifactKind::Command => "command",
            ArtifactKind::FilePath => "file_path",
            ArtifactKind::Content => "content",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed string extracted from a tool call.
///
/// Invariant: `value` is never empty. Construction goes through
/// [`Artifact::new`], which returns `None` for empty values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub value: String,

    /// Free-text provenance, e.g. which field of the tool input the
    /// artifact came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Artifact {
    /// Create an artifact, rejecting empty values.
    pub fn new(kind: ArtifactKind, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            value,
            context: None,
        })
    }

    /// Create an artifact with a provenance note.
    pub fn with_context(
        kind: ArtifactKind,
        value: impl Into<String>,
        context: impl Into<String>,
    ) -> Option<Self> {
        let mut artifact = Self::new(kind, value)?;
        artifact.context = Some(context.into());
        Some(artifact)
    }

    pub fn url(value: impl Into<String>) -> Option<Self> {
        Self::new(ArtifactKind::Url, value)
    }

    pub fn command(value: impl Into<String>) -> Option<Self> {
        Self::new(ArtifactKind::Command, value)
    }

    pub fn file_path(value: impl Into<String>) -> Option<Self> {
        Self::new(ArtifactKind::FilePath, value)
    }

    pub fn content(value: impl Into<String>) -> Option<Self> {
        Self::new(ArtifactKind::Content, value)
    }
}

/// De-duplicate artifacts on `(kind, value)`, preserving first-seen order.
pub fn dedup_artifacts(artifacts: Vec<Artifact>) -> Vec<Artifact> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        if seen.insert((artifact.kind, artifact.value.clone())) {
            out.push(artifact);
        }
    }
    out
}
