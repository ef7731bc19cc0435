//! Hook-call I/O contract.
//!
//! The host delivers one JSON payload on stdin; Sage emits exactly one
//! line of JSON on stdout and always exits 0. This module owns both
//! directions: decoding the payload (UTF-8, then UTF-16LE for Windows
//! hosts, BOM stripped) and rendering the verdict in each host's
//! native response shape.

pub mod response;

use anyhow::{bail, Result};
use tracing::debug;

use crate::engine::EvalRequest;

/// Decode raw hook-stdin bytes into a string. Tries UTF-8 first, then
/// UTF-16LE; a BOM in either encoding is stripped.
///
/// ASCII text encoded as UTF-16LE is byte-wise valid UTF-8 (every other
/// byte is NUL), so a clean UTF-8 decode that still contains NUL bytes
/// is re-tried as UTF-16LE before being accepted.
pub fn decode_hook_input(bytes: &[u8]) -> Result<String> {
    let utf8_bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let utf8 = std::str::from_utf8(utf8_bytes).ok();
    if let Some(text) = utf8 {
        if !text.contains('\0') {
            return Ok(text.to_string());
        }
    }

    let utf16_bytes = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    if utf16_bytes.len() % 2 == 0 {
        let units: Vec<u16> = utf16_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(text) = String::from_utf16(&units) {
            debug!("Hook input decoded as UTF-16LE");
            return Ok(text);
        }
    }

    // NUL-bearing but otherwise valid UTF-8 that failed the UTF-16
    // retry is handed through as-is.
    if let Some(text) = utf8 {
        return Ok(text.to_string());
    }

    bail!("hook input is neither UTF-8 nor UTF-16LE")
}

/// Parse a decoded hook payload into an evaluation request.
pub fn parse_hook_request(input: &str) -> Result<EvalRequest> {
    Ok(serde_json::from_str(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str =
        r#"{"session_id":"sid-1","tool_name":"Bash","tool_input":{"command":"ls"}}"#;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_hook_input(PAYLOAD.as_bytes()).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_decode_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(PAYLOAD.as_bytes());
        assert_eq!(decode_hook_input(&bytes).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_decode_utf16le_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in PAYLOAD.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_hook_input(&bytes).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_decode_utf16le_without_bom() {
        let mut bytes = Vec::new();
        for unit in PAYLOAD.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_hook_input(&bytes).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_parse_request() {
        let request = parse_hook_request(PAYLOAD).unwrap();
        assert_eq!(request.tool_name, "Bash");
        assert_eq!(request.session_id.as_deref(), Some("sid-1"));
        assert!(request.tool_use_id.is_none());
    }

    #[test]
    fn test_parse_request_missing_tool_name_fails() {
        assert!(parse_hook_request(r#"{"tool_input":{}}"#).is_err());
        assert!(parse_hook_request("not json").is_err());
    }
}
