//! Unified-diff extraction for Apply-Patch tools.
//!
//! File paths come from the `--- a/<path>` / `+++ b/<path>` headers.
//! Added lines are also scanned: URLs in `+` lines become `url`
//! artifacts and the joined added text becomes a `content` artifact, so
//! a payload smuggled into a patch body does not slip past the
//! heuristics.

use serde_json::Value;

use crate::artifact::{Artifact, ArtifactKind};
use crate::extract::{content_artifacts, extract_urls};
use crate::normalize::normalize_file_path;

/// Extract artifacts from an Apply-Patch tool input. The patch text is
/// looked up under `patch`, `diff` or `input`.
pub fn extract_patch(input: &Value) -> Vec<Artifact> {
    let Some(patch) = ["patch", "diff", "input"]
        .iter()
        .find_map(|field| input.get(field).and_then(Value::as_str))
    else {
        return Vec::new();
    };

    let mut artifacts = Vec::new();
    let mut added_lines = Vec::new();

    for line in patch.lines() {
        if let Some(path) = header_path(line) {
            artifacts.extend(Artifact::file_path(normalize_file_path(path)));
        } else if let Some(added) = line.strip_prefix('+') {
            // `+++` headers are consumed above; a lone `+` begins an
            // added line.
            if !line.starts_with("+++") {
                added_lines.push(added);
                for url in extract_urls(added) {
                    artifacts.extend(Artifact::with_context(ArtifactKind::Url, url, "patch"));
                }
            }
        }
    }

    if !added_lines.is_empty() {
        artifacts.extend(
            content_artifacts(&added_lines.join("\n"))
                .into_iter()
                .filter(|a| a.kind == ArtifactKind::Content),
        );
    }

    artifacts
}

/// Path from a `--- a/x` or `+++ b/x` header; `/dev/null` is the
/// create/delete sentinel, not a real path.
fn header_path(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix("--- ")
        .or_else(|| line.strip_prefix("+++ "))?;
    let path = rest
        .strip_prefix("a/")
        .or_else(|| rest.strip_prefix("b/"))
        .unwrap_or(rest);
    let path = path.split('\t').next().unwrap_or(path).trim();
    if path.is_empty() || path == "/dev/null" {
        None
    } else {
        Some(path)
    }
}
