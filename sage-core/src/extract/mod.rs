//! Artifact extraction from tool-call payloads.
//!
//! The host adapter has already mapped its native tool name onto one of
//! the names handled here. Extraction turns the tool input into an
//! ordered, de-duplicated artifact list; everything downstream (the
//! heuristics engine, the allowlist, reputation) consumes that list.

pub mod packages;
pub mod patch;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::artifact::{dedup_artifacts, Artifact, ArtifactKind};
use crate::normalize::normalize_file_path;

/// Content artifacts are capped before heuristic matching and URL
/// extraction; anything beyond the cap is dropped.
pub const CONTENT_CAP_BYTES: usize = 64 * 1024;

/// Literal URLs inside free text. Trailing punctuation that commonly
/// closes a sentence or shell word is trimmed from each hit.
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+").expect("static URL regex")
});

/// Extract every literal `http(s)` URL from `text`.
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ')', ']', '\'', '"', '>'])
                .to_string()
        })
        .filter(|url| !url.is_empty())
        .collect()
}

/// Produce the artifact list for one tool call.
///
/// Unknown tools produce no artifacts; the evaluator decides what an
/// empty list means under the active sensitivity.
pub fn extract_artifacts(tool_name: &str, tool_input: &Value) -> Vec<Artifact> {
    let artifacts = match tool_name {
        "Bash" => extract_bash(tool_input),
        "WebFetch" => extract_web_fetch(tool_input),
        "Write" => extract_write(tool_input, "content"),
        "Edit" => extract_write(tool_input, "new_string"),
        "Read" => extract_read(tool_input),
        "Apply-Patch" | "ApplyPatch" => patch::extract_patch(tool_input),
        "Delete" | "Remove" | "List" | "LS" | "Glob" | "Grep" | "Search" => {
            extract_path_only(tool_input)
        }
        other => {
            debug!("No extractor for tool '{other}'");
            Vec::new()
        }
    };
    dedup_artifacts(artifacts)
}

/// Bash: the full command text is one `command` artifact, heredoc bodies
/// included. Stripping heredocs before heuristic matching would let a
/// payload hide inside the body, so the command artifact is the raw text.
fn extract_bash(input: &Value) -> Vec<Artifact> {
    let Some(command) = input.get("command").and_then(Value::as_str) else {
        return Vec::new();
    };
    let mut artifacts = Vec::new();
    artifacts.extend(Artifact::command(command));
    for url in extract_urls(command) {
        artifacts.extend(Artifact::with_context(ArtifactKind::Url, url, "command"));
    }
    artifacts
}

fn extract_web_fetch(input: &Value) -> Vec<Artifact> {
    input
        .get("url")
        .and_then(Value::as_str)
        .and_then(Artifact::url)
        .into_iter()
        .collect()
}

/// Write/Edit: the target path plus the (capped) content and any URLs in
/// it. `content_field` is `content` for Write and `new_string` for Edit.
fn extract_write(input: &Value, content_field: &str) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    if let Some(path) = input.get("file_path").and_then(Value::as_str) {
        artifacts.extend(Artifact::file_path(normalize_file_path(path)));
    }
    if let Some(content) = input.get(content_field).and_then(Value::as_str) {
        artifacts.extend(content_artifacts(content));
    }
    artifacts
}

fn extract_read(input: &Value) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    if let Some(path) = input.get("file_path").and_then(Value::as_str) {
        artifacts.extend(Artifact::file_path(normalize_file_path(path)));
    }
    if let Some(content) = input.get("content").and_then(Value::as_str) {
        artifacts.extend(content_artifacts(content));
    }
    artifacts
}

fn extract_path_only(input: &Value) -> Vec<Artifact> {
    ["file_path", "path", "pattern_path", "directory"]
        .iter()
        .filter_map(|field| input.get(field).and_then(Value::as_str))
        .filter_map(|path| Artifact::file_path(normalize_file_path(path)))
        .collect()
}

/// One capped `content` artifact plus a `url` artifact per URL found in
/// the capped text.
pub(crate) fn content_artifacts(content: &str) -> Vec<Artifact> {
    let capped = cap_content(content);
    let urls = extract_urls(&capped);
    let mut artifacts = Vec::new();
    artifacts.extend(Artifact::content(capped));
    for url in urls {
        artifacts.extend(Artifact::with_context(ArtifactKind::Url, url, "content"));
    }
    artifacts
}

fn cap_content(content: &str) -> String {
    if content.len() <= CONTENT_CAP_BYTES {
        return content.to_string();
    }
    // Truncate on a char boundary at or below the cap.
    let mut cut = CONTENT_CAP_BYTES;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(
        "Content truncated from {} to {} bytes before extraction",
        content.len(),
        cut
    );
    content[..cut].to_string()
}
