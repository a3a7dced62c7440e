//! Shell execution and process management module.
//!
//! This module owns the persistent interactive shell: spawning it on a PTY,
//! driving commands through it with a sentinel protocol, and bounding each
//! command with an adaptive timeout.

mod ansi;
mod pty;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod timeout;

pub use ansi::strip_ansi_codes;
pub use pty::{PtySpawner, PtyTerminal};
pub use session::{
    ExecOutcome, ExecStatus, LinePoll, SessionSettings, SessionState, ShellSession, Spawner,
    Terminal,
};
pub use timeout::{SmartTimeout, TimeoutReason};
