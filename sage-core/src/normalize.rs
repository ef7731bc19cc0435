//! Canonical forms for the keys used by the allowlist and verdict cache.
//!
//! These normalizers are pure and total. Writers and readers must agree
//! byte-for-byte: an allowlist entry added as `HTTP://Safe.COM/p?b=1&a=2`
//! has to match a later lookup for `http://safe.com/p?a=2&b=1`.

use sha2::{Digest, Sha256};
use std::path::{Component, PathBuf};
use url::Url;

/// Normalize a URL for use as an allowlist or cache key.
///
/// Lowercases scheme and host, drops the fragment, sorts query parameters
/// by key name (stable, so repeated keys keep their relative order), and
/// preserves path case. Strings that do not parse as URLs are lowercased
/// as-is.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw.trim()) else {
        return raw.trim().to_lowercase();
    };

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        if pairs.is_empty() {
            parsed.set_query(None);
        } else {
            parsed
                .query_pairs_mut()
                .clear()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
    }

    parsed.to_string()
}

/// SHA-256 hex digest of the exact command bytes.
pub fn hash_command(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a file path for use as an allowlist key.
///
/// Expands a leading `~` to the home directory and collapses `.` / `..`
/// lexically. No symlink resolution and no case folding: two paths that
/// reach the same inode through different links stay distinct keys.
pub fn normalize_file_path(raw: &str) -> String {
    let expanded = expand_tilde(raw.trim());
    lexical_normalize(&expanded)
}

fn expand_tilde(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Pure lexical `.`/`..` collapse over path components.
fn lexical_normalize(path: &str) -> String {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in std::path::Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    // Relative path escaping its base keeps the `..`.
                    out.push("..");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        return ".".to_string();
    }
    out.to_string_lossy().into_owned()
}
