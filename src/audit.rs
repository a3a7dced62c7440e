//! Append-only audit trail.
//!
//! Three JSON-lines streams are opened once per process, one each for
//! executed commands, granted overrides and execution errors. Every record is
//! written and flushed before `record` returns.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::shell::TimeoutReason;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAudit {
    pub timestamp: String,
    pub command: String,
    pub success: bool,
    pub is_override: bool,
    pub timeout: bool,
    pub timeout_reason: Option<TimeoutReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideAudit {
    pub timestamp: String,
    pub command: String,
    pub reason: String,
    pub override_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAudit {
    pub timestamp: String,
    pub command: String,
    pub error: String,
    pub traceback: String,
}

/// One audit record; the variant picks the stream it lands in.
#[derive(Debug, Clone)]
pub enum AuditEntry {
    Command(CommandAudit),
    Override(OverrideAudit),
    Error(ErrorAudit),
}

/// Timestamp format used in every record.
pub fn audit_timestamp() -> String {
    Local::now().to_rfc3339()
}

struct AuditStream {
    path: PathBuf,
    file: File,
}

impl AuditStream {
    fn open(dir: &Path, kind: &str, suffix: &str) -> anyhow::Result<Self> {
        let path = dir.join(format!("{}-{}.log", kind, suffix));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        Ok(Self { path, file })
    }

    fn append<T: Serialize>(&self, record: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to serialize audit record")?;
        line.push(b'\n');
        let mut file = &self.file;
        file.write_all(&line)
            .and_then(|()| file.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}

pub struct AuditSink {
    commands: AuditStream,
    overrides: AuditStream,
    errors: AuditStream,
}

impl AuditSink {
    /// Open `commands-<start>.log`, `overrides-<start>.log` and
    /// `errors-<start>.log` under `dir`.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
        let suffix = Local::now().format("%Y%m%d-%H%M%S").to_string();
        Ok(Self {
            commands: AuditStream::open(dir, "commands", &suffix)?,
            overrides: AuditStream::open(dir, "overrides", &suffix)?,
            errors: AuditStream::open(dir, "errors", &suffix)?,
        })
    }

    /// Append `entry` to its stream.
    ///
    /// A failed write is reported through tracing and otherwise ignored: a
    /// full disk must not turn an executed command into a reported failure.
    pub fn record(&self, entry: AuditEntry) {
        let result = match &entry {
            AuditEntry::Command(record) => self.commands.append(record),
            AuditEntry::Override(record) => self.overrides.append(record),
            AuditEntry::Error(record) => self.errors.append(record),
        };
        if let Err(e) = result {
            error!("Audit write failed: {:#}", e);
        }
    }

    pub fn command_log(&self) -> &Path {
        &self.commands.path
    }

    pub fn override_log(&self) -> &Path {
        &self.overrides.path
    }

    pub fn error_log(&self) -> &Path {
        &self.errors.path
    }
}
