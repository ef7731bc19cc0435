//! Verdict rendering for each supported host.
//!
//! Allow is always silent; deny carries a short branded reason; ask
//! carries the threat summary plus the action id so a later approval
//! can be correlated with this exact call.

use serde_json::{json, Value};

use crate::engine::decision::{Decision, Verdict};

/// Short branded reason line shown to the user on deny/ask.
pub fn block_reason(verdict: &Verdict) -> String {
    let detail = verdict
        .reasons
        .first()
        .map(String::as_str)
        .unwrap_or("suspicious activity detected");
    match verdict.decision {
        Decision::Deny => format!("Sage blocked this action: {detail}"),
        Decision::Ask => format!("Sage needs confirmation: {detail}"),
        Decision::Allow => String::new(),
    }
}

/// Claude-style hook response: `{}` for allow, otherwise a
/// `hookSpecificOutput` with the permission decision.
pub fn claude_response(verdict: &Verdict) -> Value {
    match verdict.decision {
        Decision::Allow => json!({}),
        Decision::Deny | Decision::Ask => json!({
            "hookSpecificOutput": {
                "hookEventName": "PreToolUse",
                "permissionDecision": verdict.decision.as_str(),
                "permissionDecisionReason": block_reason(verdict),
            }
        }),
    }
}

/// Cursor-style preToolUse response. Cursor has no ask at this hook
/// point, so ask renders as deny with the confirmation reason.
pub fn cursor_pre_tool_use_response(verdict: &Verdict) -> Value {
    match verdict.decision {
        Decision::Allow => json!({"decision": "allow"}),
        Decision::Deny | Decision::Ask => json!({
            "decision": "deny",
            "reason": block_reason(verdict),
        }),
    }
}

/// Cursor-style before-event response with the full permission model.
pub fn cursor_before_event_response(verdict: &Verdict) -> Value {
    match verdict.decision {
        Decision::Allow => json!({"permission": "allow"}),
        Decision::Ask => json!({
            "permission": "ask",
            "user_message": block_reason(verdict),
        }),
        Decision::Deny => json!({
            "permission": "deny",
            "user_message": block_reason(verdict),
            "agent_message": block_reason(verdict),
        }),
    }
}

/// In-process agent response (OpenClaw / OpenCode): a block flag with
/// the reason; ask embeds the action id so the host can approve it.
pub fn agent_response(verdict: &Verdict, action_id: &str) -> Value {
    match verdict.decision {
        Decision::Allow => json!({"block": false}),
        Decision::Deny => json!({
            "block": true,
            "blockReason": block_reason(verdict),
        }),
        Decision::Ask => json!({
            "block": true,
            "blockReason": format!("{} (actionId: {action_id})", block_reason(verdict)),
            "actionId": action_id,
        }),
    }
}
