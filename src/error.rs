//! Error taxonomy for the admission and execution pipeline.
//!
//! Every rejected or failed invocation is described by an [`ErrorKind`], so
//! callers branch on a value instead of parsing messages. Denials carry a
//! [`GateError`]; timeouts and a dead session are reported inside a
//! [`CommandResult`](crate::gate::CommandResult) because partial output has to
//! travel with them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::PermissionBucket;
use crate::shell::TimeoutReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Matched the static denylist. Never overridable.
    DangerousPattern,
    /// Classified ask or block; recoverable via override or approval.
    PermissionDenied,
    /// Override cooldown or hourly cap hit; retry later.
    RateLimited,
    /// Malformed override/approval request.
    InvalidRequest,
    /// The shell process went away; recover with `reset_session`.
    SessionTerminated,
    /// The running command was interrupted by the timeout policy.
    TimeoutExceeded(TimeoutReason),
    UnexpectedExecutionError,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Blocked: {0}")]
    DangerousPattern(String),

    #[error("{message}")]
    PermissionDenied {
        bucket: PermissionBucket,
        message: String,
    },

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Unexpected execution error: {0:#}")]
    Unexpected(#[source] anyhow::Error),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::DangerousPattern(_) => ErrorKind::DangerousPattern,
            GateError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            GateError::RateLimited(_) => ErrorKind::RateLimited,
            GateError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            GateError::Unexpected(_) => ErrorKind::UnexpectedExecutionError,
        }
    }
}
