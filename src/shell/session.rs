//! Persistent shell session and the command polling loop.
//!
//! A command is written to the terminal followed by a `printf` that emits a
//! per-command sentinel. The loop then polls for lines until one of:
//!
//! - the sentinel shows up (success),
//! - the terminal closes (session terminated),
//! - the [`SmartTimeout`] fires, in which case the foreground job is
//!   interrupted and partial output is returned.
//!
//! Terminals and time are injected so the loop can be driven without a real
//! process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::timeout::{SmartTimeout, TimeoutReason};
use crate::utils::clock::Clock;

const SENTINEL_PREFIX: &str = "__RUSTY_GATE_DONE_";
/// Upper bound on leftover lines discarded before a command.
const MAX_STALE_EVENTS: usize = 10_000;

/// What a single poll of the terminal produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinePoll {
    Line(String),
    /// Output arrived but no line is complete yet.
    Activity,
    /// Nothing arrived within the poll interval.
    Pending,
    /// End of stream: the shell is gone.
    Closed,
}

/// A live interactive process.
pub trait Terminal: Send {
    fn send(&mut self, text: &str) -> Result<()>;
    fn poll_line(&mut self, wait: Duration) -> LinePoll;
    /// Interrupt the foreground job without killing the shell.
    fn interrupt(&mut self) -> Result<()>;
    /// Kill the process. Failures are ignored.
    fn terminate(&mut self);
}

pub trait Spawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn Terminal>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// The shell exited; only `restart` brings it back.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    TimedOut(TimeoutReason),
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub output: String,
    pub status: ExecStatus,
}

/// Completion marker for one command.
///
/// The marker is printed as two `printf` arguments so the terminal echo of
/// the command never contains the joined token; only real output does.
struct Sentinel {
    nonce: String,
    token: String,
}

impl Sentinel {
    fn new() -> Self {
        let nonce = format!("{}__", Uuid::new_v4().simple());
        let token = format!("{}{}", SENTINEL_PREFIX, nonce);
        Self { nonce, token }
    }

    fn script(&self) -> String {
        format!("printf '%s%s\\n' '{}' '{}'", SENTINEL_PREFIX, self.nonce)
    }
}

pub struct ShellSession {
    spawner: Arc<dyn Spawner>,
    terminal: Box<dyn Terminal>,
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    state: SessionState,
    // Set after a timeout so the next command waits for the interrupt's echo.
    interrupted: bool,
}

impl ShellSession {
    pub fn spawn(
        spawner: Arc<dyn Spawner>,
        settings: SessionSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let terminal = spawner.spawn().context("Failed to start shell session")?;
        Ok(Self {
            spawner,
            terminal,
            settings,
            clock,
            state: SessionState::Running,
            interrupted: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run `command` with the configured timeouts.
    ///
    /// # Arguments
    /// * `command` - Shell text, sent as typed
    /// * `on_line` - Called with each output line as it arrives
    ///
    /// # Returns
    /// The captured output and how the command ended. Timeouts and a dead
    /// shell are outcomes, not errors; `Err` means the terminal could not be
    /// written to.
    pub fn execute(
        &mut self,
        command: &str,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutcome> {
        let timeout = SmartTimeout::new(
            self.settings.idle_timeout,
            self.settings.max_timeout,
            self.clock.clone(),
        );
        self.execute_with_timeout(command, on_line, timeout)
    }

    pub fn execute_with_timeout(
        &mut self,
        command: &str,
        mut on_line: Option<&mut dyn FnMut(&str)>,
        mut timeout: SmartTimeout,
    ) -> Result<ExecOutcome> {
        if self.state == SessionState::Terminated {
            return Ok(ExecOutcome {
                output: String::new(),
                status: ExecStatus::Terminated,
            });
        }

        self.drain_stale();

        let sentinel = Sentinel::new();
        self.terminal
            .send(&format!("{}\n{}\n", command, sentinel.script()))?;
        debug!("Sent command to shell: {}", command);

        let mut lines: Vec<String> = Vec::new();
        let mut observe = |line: String, timeout: &mut SmartTimeout, lines: &mut Vec<String>| {
            if let Some(cb) = on_line.as_mut() {
                cb(&line);
            }
            timeout.saw_output();
            lines.push(line);
        };

        loop {
            match self.terminal.poll_line(self.settings.poll_interval) {
                LinePoll::Line(line) => {
                    if let Some(pos) = line.find(&sentinel.token) {
                        // Output without a trailing newline shares the sentinel's line.
                        let before = &line[..pos];
                        if !before.trim().is_empty() {
                            observe(before.to_string(), &mut timeout, &mut lines);
                        }
                        return Ok(ExecOutcome {
                            output: lines.join("\n"),
                            status: ExecStatus::Completed,
                        });
                    }
                    if line.contains(&sentinel.nonce) {
                        // Echo of our own printf
                        continue;
                    }
                    observe(line, &mut timeout, &mut lines);
                    // A command that never stops printing still hits the ceiling.
                    if let Some(reason) = timeout.check() {
                        return Ok(self.abort(reason, lines));
                    }
                }
                LinePoll::Activity => {
                    timeout.saw_output();
                    if let Some(reason) = timeout.check() {
                        return Ok(self.abort(reason, lines));
                    }
                }
                LinePoll::Closed => {
                    warn!("Shell session terminated while running: {}", command);
                    self.state = SessionState::Terminated;
                    return Ok(ExecOutcome {
                        output: lines.join("\n"),
                        status: ExecStatus::Terminated,
                    });
                }
                LinePoll::Pending => {
                    if let Some(reason) = timeout.check() {
                        return Ok(self.abort(reason, lines));
                    }
                }
            }
        }
    }

    /// Discard what the previous command left behind: the `^C` echo and
    /// prompt after an interrupt, or rc-file noise before the first command.
    fn drain_stale(&mut self) {
        let wait = if self.interrupted {
            self.settings.poll_interval
        } else {
            Duration::ZERO
        };
        self.interrupted = false;
        for _ in 0..MAX_STALE_EVENTS {
            match self.terminal.poll_line(wait) {
                LinePoll::Line(line) => debug!("Discarding stale shell output: {}", line),
                LinePoll::Activity => {}
                LinePoll::Pending | LinePoll::Closed => return,
            }
        }
        warn!("Shell still producing output before next command; proceeding anyway");
    }

    fn abort(&mut self, reason: TimeoutReason, lines: Vec<String>) -> ExecOutcome {
        warn!("Command timed out ({}), interrupting", reason);
        if let Err(e) = self.terminal.interrupt() {
            warn!("Failed to interrupt shell: {:#}", e);
        }
        self.interrupted = true;
        ExecOutcome {
            output: lines.join("\n"),
            status: ExecStatus::TimedOut(reason),
        }
    }

    /// Kill the current shell (ignoring failures) and start a fresh one.
    pub fn restart(&mut self) -> Result<()> {
        self.terminal.terminate();
        self.state = SessionState::Terminated;
        self.terminal = self.spawner.spawn().context("Failed to restart shell session")?;
        self.state = SessionState::Running;
        self.interrupted = false;
        info!("Shell session restarted");
        Ok(())
    }
}
