//! Scripted terminal used by session and gate tests.
//!
//! Each submitted command is answered by a [`Script`]. Time only moves when
//! the terminal reports an empty poll, so timeouts fire after a
//! deterministic number of polls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::session::{LinePoll, Spawner, Terminal};
use crate::utils::clock::{Clock, ManualClock};

#[derive(Debug, Clone)]
pub enum Script {
    /// Print these lines, then complete.
    Output(Vec<String>),
    /// Print text without a newline, so it shares a line with the sentinel.
    NoTrailingNewline(String),
    /// Print these lines, then go quiet until interrupted.
    Hang(Vec<String>),
    /// Print these lines, then the shell exits.
    Exit(Vec<String>),
    /// Print `y` forever.
    Endless,
    /// Report partial output for `polls` polls, then print `line` and complete.
    Trickle { polls: usize, line: String },
}

#[derive(Debug, Default, Clone)]
pub struct TermLog {
    pub spawns: usize,
    pub commands: Vec<String>,
    pub interrupts: usize,
    pub kills: usize,
}

type ScriptFn = dyn Fn(&str) -> Script + Send + Sync;

#[derive(Clone)]
pub struct ScriptedSpawner {
    script: Arc<ScriptFn>,
    clock: Arc<ManualClock>,
    log: Arc<Mutex<TermLog>>,
    echo: bool,
    banner: Vec<String>,
}

impl ScriptedSpawner {
    pub fn new(script: impl Fn(&str) -> Script + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            clock: Arc::new(ManualClock::new()),
            log: Arc::new(Mutex::new(TermLog::default())),
            echo: false,
            banner: Vec::new(),
        }
    }

    /// Lines a fresh shell prints before any command, like rc-file output.
    pub fn with_banner(mut self, lines: &[&str]) -> Self {
        self.banner = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Echo submitted input back like a tty in canonical mode.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn log(&self) -> TermLog {
        self.log.lock().unwrap().clone()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self) -> Result<Box<dyn Terminal>> {
        self.log.lock().unwrap().spawns += 1;
        Ok(Box::new(ScriptedTerminal {
            script: self.script.clone(),
            clock: self.clock.clone(),
            log: self.log.clone(),
            echo: self.echo,
            queue: self.banner.iter().cloned().collect(),
            mode: Mode::Idle,
            trickle: None,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Hanging,
    Endless,
    Exited,
}

struct ScriptedTerminal {
    script: Arc<ScriptFn>,
    clock: Arc<ManualClock>,
    log: Arc<Mutex<TermLog>>,
    echo: bool,
    queue: VecDeque<String>,
    mode: Mode,
    // Activity polls left, then the final line.
    trickle: Option<(usize, String)>,
}

/// Rebuild the sentinel token from `printf '%s%s\n' 'PREFIX' 'NONCE'`.
fn sentinel_from(printf_line: &str) -> String {
    let parts: Vec<&str> = printf_line.split('\'').collect();
    format!("{}{}", parts[3], parts[5])
}

impl Terminal for ScriptedTerminal {
    fn send(&mut self, text: &str) -> Result<()> {
        if self.mode == Mode::Exited {
            return Err(anyhow!("terminal closed"));
        }
        let mut lines: Vec<&str> = text.trim_end_matches('\n').lines().collect();
        let printf_line = lines.pop().ok_or_else(|| anyhow!("empty input"))?;
        let command = lines.join("\n");
        let token = sentinel_from(printf_line);

        self.log.lock().unwrap().commands.push(command.clone());
        if self.echo {
            self.queue.push_back(command.clone());
            self.queue.push_back(printf_line.to_string());
        }

        match (self.script)(&command) {
            Script::Output(out) => {
                self.queue.extend(out);
                self.queue.push_back(token);
            }
            Script::NoTrailingNewline(text) => {
                self.queue.push_back(format!("{}{}", text, token));
            }
            Script::Hang(out) => {
                self.queue.extend(out);
                self.mode = Mode::Hanging;
            }
            Script::Exit(out) => {
                self.queue.extend(out);
                self.mode = Mode::Exited;
            }
            Script::Endless => self.mode = Mode::Endless,
            Script::Trickle { polls, line } => {
                self.trickle = Some((polls, format!("{}{}", line, token)));
            }
        }
        Ok(())
    }

    fn poll_line(&mut self, wait: Duration) -> LinePoll {
        if let Some(line) = self.queue.pop_front() {
            return LinePoll::Line(line);
        }
        if let Some((left, line)) = self.trickle.take() {
            self.clock.advance(wait);
            if left == 0 {
                return LinePoll::Line(line);
            }
            self.trickle = Some((left - 1, line));
            return LinePoll::Activity;
        }
        match self.mode {
            Mode::Exited => LinePoll::Closed,
            Mode::Endless => {
                self.clock.advance(wait);
                LinePoll::Line("y".to_string())
            }
            Mode::Idle | Mode::Hanging => {
                self.clock.advance(wait);
                LinePoll::Pending
            }
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        self.log.lock().unwrap().interrupts += 1;
        self.trickle = None;
        if matches!(self.mode, Mode::Hanging | Mode::Endless) {
            self.mode = Mode::Idle;
            self.queue.push_back("^C".to_string());
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.log.lock().unwrap().kills += 1;
        self.queue.clear();
        self.mode = Mode::Exited;
    }
}
