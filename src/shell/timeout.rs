//! Adaptive timeout for a single command.
//!
//! Two independent limits: an absolute ceiling measured from the start of
//! the command, and an idle ceiling measured from the last line of output.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// Total runtime exceeded the ceiling.
    MaxTimeout,
    /// No output for longer than the idle ceiling.
    OutputTimeout,
}

impl TimeoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutReason::MaxTimeout => "max_timeout",
            TimeoutReason::OutputTimeout => "output_timeout",
        }
    }
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SmartTimeout {
    idle: Duration,
    max: Duration,
    start: Instant,
    last_output: Instant,
    clock: Arc<dyn Clock>,
}

impl SmartTimeout {
    pub fn new(idle: Duration, max: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            idle,
            max,
            start: now,
            last_output: now,
            clock,
        }
    }

    /// Reset the idle clock. The absolute ceiling is unaffected.
    pub fn saw_output(&mut self) {
        self.last_output = self.clock.now();
    }

    pub fn check(&self) -> Option<TimeoutReason> {
        let now = self.clock.now();
        if now.saturating_duration_since(self.start) > self.max {
            return Some(TimeoutReason::MaxTimeout);
        }
        if now.saturating_duration_since(self.last_output) > self.idle {
            return Some(TimeoutReason::OutputTimeout);
        }
        None
    }
}
