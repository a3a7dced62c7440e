//! Command execution gating with security verdict enforcement.
//!
//! Turns a base command name and its permission state into a single
//! execution decision, so the direct execution path and status queries
//! agree on what is allowed.

use super::PermissionBucket;

/// Result of attempting to execute a command through the security gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionDecision {
    /// Command should be executed immediately
    Execute,
    /// Command needs an override or an operator approval first
    RequireConfirmation { reason: String },
    /// Command is denied outright
    Deny { reason: String },
}

/// Decide what to do with a command whose base name is `base`.
///
/// A session allowance wins over the bucket. An empty base name is never
/// executed.
///
/// # Examples
/// ```
/// use rusty_gate::security::{gate_command, ExecutionDecision, PermissionBucket};
///
/// let decision = gate_command("ls", PermissionBucket::AlwaysAllow, false);
/// assert_eq!(decision, ExecutionDecision::Execute);
///
/// let decision = gate_command("rm", PermissionBucket::AlwaysAsk, true);
/// assert_eq!(decision, ExecutionDecision::Execute);
///
/// let decision = gate_command("vim", PermissionBucket::AlwaysBlock, false);
/// assert!(matches!(decision, ExecutionDecision::Deny { .. }));
/// ```
pub fn gate_command(base: &str, bucket: PermissionBucket, session_allowed: bool) -> ExecutionDecision {
    if base.is_empty() {
        return ExecutionDecision::RequireConfirmation {
            reason: "Empty command".to_string(),
        };
    }
    if session_allowed {
        return ExecutionDecision::Execute;
    }
    match bucket {
        PermissionBucket::AlwaysAllow => ExecutionDecision::Execute,
        PermissionBucket::AlwaysAsk => ExecutionDecision::RequireConfirmation {
            reason: format!(
                "'{}' is not pre-approved; use execute_with_override or ask the operator to approve it",
                base
            ),
        },
        PermissionBucket::AlwaysBlock => ExecutionDecision::Deny {
            reason: interactive_block_message(base),
        },
    }
}

/// Explains why interactive/TUI programs are refused and what to use instead.
fn interactive_block_message(base: &str) -> String {
    format!(
        "BLOCKED interactive/TUI program: {}\n\
         This server cannot run interactive programs; use non-interactive alternatives \
         (cat/head/tail for viewing, single-shot ps for monitoring).",
        base
    )
}
