//! Security module for command admission.
//!
//! This module holds the pieces that decide whether a command may reach the
//! shell: the static danger filter, the persisted permission buckets, the
//! override limiter and the verdict that combines them.

mod buckets;
pub mod executor;
mod overrides;
mod patterns;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use buckets::{BucketMap, PermissionBucketStore};
pub use executor::{gate_command, ExecutionDecision};
pub use overrides::{OverrideHistoryEntry, OverrideRateLimiter, RateLimits};
pub use patterns::DangerPatternFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBucket {
    AlwaysAllow,
    AlwaysAsk,
    AlwaysBlock,
}

impl PermissionBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionBucket::AlwaysAllow => "always_allow",
            PermissionBucket::AlwaysAsk => "always_ask",
            PermissionBucket::AlwaysBlock => "always_block",
        }
    }
}

impl fmt::Display for PermissionBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File name of the first shell word, or `""` when the command is empty or
/// cannot be tokenized (unbalanced quotes and the like).
pub fn base_command(command: &str) -> String {
    let Some(words) = shlex::split(command) else {
        return String::new();
    };
    let Some(first) = words.first() else {
        return String::new();
    };
    Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_command_parsing() {
        assert_eq!(base_command("ls -la /tmp"), "ls");
        assert_eq!(base_command("/usr/bin/rm -rf /"), "rm");
        assert_eq!(base_command(""), "");
    }

    #[test]
    fn test_base_command_edge_cases() {
        assert_eq!(base_command("   "), "");
        assert_eq!(base_command("echo 'unterminated"), "");
        assert_eq!(base_command("'/opt/my tools/run' --fast"), "run");
        assert_eq!(base_command("./build.sh release"), "build.sh");
    }

    #[test]
    fn test_bucket_names() {
        assert_eq!(PermissionBucket::AlwaysAsk.to_string(), "always_ask");
        assert_eq!(
            serde_json::to_string(&PermissionBucket::AlwaysBlock).unwrap(),
            "\"always_block\""
        );
    }
}
