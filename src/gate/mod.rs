//! Command admission and execution.
//!
//! [`CommandGate`] is the process-wide context that every tool call goes
//! through. It screens commands against the danger filter, classifies them
//! with the permission buckets and session allowances, applies the override
//! friction, runs admitted commands on the persistent shell and writes the
//! audit trail.
//!
//! The shell read loop blocks, so it runs on tokio's blocking pool while
//! output lines flow back over an unbounded channel in arrival order. The
//! session sits behind a mutex: a second execution queues behind the first.


use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context as _};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::audit::{audit_timestamp, AuditEntry, AuditSink, CommandAudit, ErrorAudit, OverrideAudit};
use crate::config::{Config, APPROVAL_PHRASE};
use crate::error::{ErrorKind, GateError};
use crate::security::{
    base_command, gate_command, DangerPatternFilter, ExecutionDecision, OverrideHistoryEntry,
    OverrideRateLimiter, PermissionBucket, PermissionBucketStore, RateLimits,
};
use crate::shell::{
    ExecOutcome, ExecStatus, PtySpawner, SessionSettings, ShellSession, Spawner, TimeoutReason,
};
use crate::utils::clock::{system_clock, Clock};

/// Receives output lines as the shell produces them.
pub type OutputSink = UnboundedSender<String>;

/// Result of a command that reached the shell.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timeout: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_reason: Option<TimeoutReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    /// Failure kind when the command did not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CommandResult {
    fn from_outcome(outcome: ExecOutcome) -> Self {
        let (success, error, timeout_reason, error_kind) = match outcome.status {
            ExecStatus::Completed => (true, None, None, None),
            ExecStatus::TimedOut(reason) => (
                false,
                None,
                Some(reason),
                Some(ErrorKind::TimeoutExceeded(reason)),
            ),
            ExecStatus::Terminated => (
                false,
                Some("Session terminated unexpectedly; call reset_session to start a new shell".to_string()),
                None,
                Some(ErrorKind::SessionTerminated),
            ),
        };
        Self {
            success,
            output: outcome.output,
            error,
            timeout: timeout_reason.is_some(),
            timeout_reason,
            warning: None,
            override_reason: None,
            error_kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionStatus {
    /// Bucket name, or `session_allowed`
    pub status: String,
    pub message: String,
    pub can_override: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_category: Option<PermissionBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDuration {
    Session,
    Permanent,
}

impl FromStr for ApprovalDuration {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(ApprovalDuration::Session),
            "permanent" => Ok(ApprovalDuration::Permanent),
            _ => Err(GateError::InvalidRequest(
                "duration must be 'session' or 'permanent'".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateOptions {
    pub session: SessionSettings,
    pub limits: RateLimits,
    pub min_reason_len: usize,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            limits: RateLimits::default(),
            min_reason_len: 50,
        }
    }
}

impl GateOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            session: config.shell.session_settings()?,
            limits: config.overrides.rate_limits(),
            min_reason_len: config.overrides.min_reason_len,
        })
    }
}

type SharedSession = Arc<Mutex<Option<ShellSession>>>;

pub struct CommandGate {
    filter: DangerPatternFilter,
    store: Arc<PermissionBucketStore>,
    overrides: OverrideRateLimiter,
    audit: AuditSink,
    // Spawned on first use.
    shell: SharedSession,
    spawner: Arc<dyn Spawner>,
    options: GateOptions,
    clock: Arc<dyn Clock>,
}

impl CommandGate {
    pub fn new(
        store: Arc<PermissionBucketStore>,
        audit: AuditSink,
        spawner: Arc<dyn Spawner>,
        options: GateOptions,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let filter = DangerPatternFilter::new().context("Invalid danger pattern")?;
        Ok(Self {
            filter,
            store,
            overrides: OverrideRateLimiter::new(options.limits, clock.clone()),
            audit,
            shell: Arc::new(Mutex::new(None)),
            spawner,
            options,
            clock,
        })
    }

    /// Build the production gate: real PTY shell, permission file seeded if
    /// missing, audit streams under the log directory.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = PermissionBucketStore::open_or_seed(&config.permissions.path)?;
        let audit = AuditSink::open(&config.logging.dir)?;
        let spawner = PtySpawner::new(&config.shell.path, config.shell.cols, config.shell.rows);
        Self::new(
            Arc::new(store),
            audit,
            Arc::new(spawner),
            GateOptions::from_config(config)?,
            system_clock(),
        )
    }

    /// Shared handle for out-of-band reloads.
    pub fn permission_store(&self) -> Arc<PermissionBucketStore> {
        self.store.clone()
    }

    /// Run a command that the buckets or a session allowance already permit.
    ///
    /// # Arguments
    /// * `command` - Shell text as the agent wrote it
    /// * `sink` - Receives each output line while the command runs
    ///
    /// # Returns
    /// The command result when it reached the shell (timeouts and a dead
    /// session included), or the reason it was refused.
    pub async fn submit(
        &mut self,
        command: &str,
        sink: Option<OutputSink>,
    ) -> Result<CommandResult, GateError> {
        self.screen(command)?;

        let base = base_command(command);
        let bucket = self.store.classify(&base);
        let session_allowed = self.overrides.is_session_allowed(&base);
        match gate_command(&base, bucket, session_allowed) {
            ExecutionDecision::Execute => self.run(command, false, sink).await,
            ExecutionDecision::RequireConfirmation { reason } => Err(GateError::PermissionDenied {
                bucket: PermissionBucket::AlwaysAsk,
                message: format!("Permission required: {}", reason),
            }),
            ExecutionDecision::Deny { reason } => Err(GateError::PermissionDenied {
                bucket: PermissionBucket::AlwaysBlock,
                message: reason,
            }),
        }
    }

    /// Run an `always_ask` command on the agent's own justification.
    ///
    /// # Arguments
    /// * `reason` - Justification, at least `min_reason_len` characters
    /// * `accept_risk` - Must be `true`
    ///
    /// # Returns
    /// The command result with the override warning and reason attached.
    pub async fn submit_with_override(
        &mut self,
        command: &str,
        reason: &str,
        accept_risk: bool,
        sink: Option<OutputSink>,
    ) -> Result<CommandResult, GateError> {
        self.screen(command)?;
        let base = base_command(command);
        if base.is_empty() {
            return Err(GateError::InvalidRequest("Command cannot be empty".to_string()));
        }

        match self.store.classify(&base) {
            PermissionBucket::AlwaysBlock => {
                return Err(GateError::PermissionDenied {
                    bucket: PermissionBucket::AlwaysBlock,
                    message: "Cannot override interactive/dangerous commands".to_string(),
                });
            }
            PermissionBucket::AlwaysAllow => {
                return Err(GateError::InvalidRequest(format!(
                    "Command '{}' does not require override",
                    base
                )));
            }
            PermissionBucket::AlwaysAsk => {}
        }
        if reason.chars().count() < self.options.min_reason_len {
            return Err(GateError::InvalidRequest(format!(
                "Provide a detailed reason ({}+ chars)",
                self.options.min_reason_len
            )));
        }
        if !accept_risk {
            return Err(GateError::InvalidRequest(
                "Must set accept_risk=true to proceed".to_string(),
            ));
        }

        let (allowed, message) = self.overrides.check();
        if !allowed {
            info!("Override for '{}' refused: {}", base, message);
            return Err(GateError::RateLimited(message));
        }

        self.overrides.grant(command, reason);
        warn!("Safety override granted for: {}", command);
        self.audit.record(AuditEntry::Override(OverrideAudit {
            timestamp: audit_timestamp(),
            command: command.to_string(),
            reason: reason.to_string(),
            override_count: self.overrides.override_count(),
        }));

        let mut result = self.run(command, true, sink).await?;
        result.warning = Some("Executed with safety override".to_string());
        result.override_reason = Some(reason.to_string());
        Ok(result)
    }

    pub fn permission_status(&self, command: &str) -> PermissionStatus {
        let base = base_command(command);
        let bucket = self.store.classify(&base);
        if self.overrides.is_session_allowed(&base) {
            return PermissionStatus {
                status: "session_allowed".to_string(),
                message: format!("'{}' temporarily allowed for this session", base),
                can_override: false,
                original_category: Some(bucket),
            };
        }
        PermissionStatus {
            status: bucket.as_str().to_string(),
            message: match bucket {
                PermissionBucket::AlwaysAsk => "defaults to ask".to_string(),
                _ => "categorized".to_string(),
            },
            can_override: bucket == PermissionBucket::AlwaysAsk,
            original_category: None,
        }
    }

    /// Operator approval: elevate a command for this session or for good.
    pub fn approve(
        &mut self,
        command: &str,
        confirmation: &str,
        duration: &str,
    ) -> Result<ActionOutcome, GateError> {
        if confirmation != APPROVAL_PHRASE {
            return Err(GateError::InvalidRequest(format!(
                "Confirmation must be exactly: '{}'",
                APPROVAL_PHRASE
            )));
        }
        let duration: ApprovalDuration = duration.parse()?;
        let base = base_command(command);
        if base.is_empty() {
            return Err(GateError::InvalidRequest("Command cannot be empty".to_string()));
        }

        match self.store.classify(&base) {
            PermissionBucket::AlwaysBlock => Err(GateError::PermissionDenied {
                bucket: PermissionBucket::AlwaysBlock,
                message: "Interactive/dangerous commands cannot be approved".to_string(),
            }),
            PermissionBucket::AlwaysAllow => Ok(ActionOutcome {
                success: true,
                message: format!("'{}' already always_allow", base),
            }),
            PermissionBucket::AlwaysAsk => match duration {
                ApprovalDuration::Session => {
                    self.overrides.allow_for_session(&base);
                    info!("Operator approved '{}' for this session", base);
                    Ok(ActionOutcome {
                        success: true,
                        message: format!("'{}' approved for this session", base),
                    })
                }
                ApprovalDuration::Permanent => {
                    self.store.promote(&base).map_err(GateError::Unexpected)?;
                    info!("Operator approved '{}' permanently", base);
                    Ok(ActionOutcome {
                        success: true,
                        message: format!("'{}' moved to always_allow", base),
                    })
                }
            },
        }
    }

    pub fn working_directory(&self) -> Result<PathBuf, GateError> {
        std::env::current_dir()
            .context("Failed to read current directory")
            .map_err(GateError::Unexpected)
    }

    /// Restart the shell and forget every session allowance.
    pub async fn reset_session(&mut self) -> Result<ActionOutcome, GateError> {
        self.overrides.clear_session();

        let shell = self.shell.clone();
        let spawner = self.spawner.clone();
        let settings = self.options.session;
        let clock = self.clock.clone();
        let restarted = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut guard = lock_session(&shell);
            match guard.as_mut() {
                Some(session) => session.restart(),
                None => {
                    *guard = Some(ShellSession::spawn(spawner, settings, clock)?);
                    Ok(())
                }
            }
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r);

        restarted.map_err(GateError::Unexpected)?;
        info!("Session reset and overrides cleared");
        Ok(ActionOutcome {
            success: true,
            message: "Session reset and overrides cleared".to_string(),
        })
    }

    pub fn override_history(&self) -> &[OverrideHistoryEntry] {
        self.overrides.history()
    }

    /// The danger filter runs ahead of every permission decision.
    fn screen(&self, command: &str) -> Result<(), GateError> {
        match self.filter.matches(command) {
            Some(reason) => {
                warn!("Blocked dangerous command ({}): {}", reason, command);
                Err(GateError::DangerousPattern(reason.to_string()))
            }
            None => Ok(()),
        }
    }

    async fn run(
        &mut self,
        command: &str,
        is_override: bool,
        sink: Option<OutputSink>,
    ) -> Result<CommandResult, GateError> {
        let shell = self.shell.clone();
        let spawner = self.spawner.clone();
        let settings = self.options.session;
        let clock = self.clock.clone();
        let cmd = command.to_string();

        let joined = tokio::task::spawn_blocking(move || -> anyhow::Result<ExecOutcome> {
            let mut guard = lock_session(&shell);
            if guard.is_none() {
                *guard = Some(ShellSession::spawn(spawner, settings, clock)?);
            }
            let session = guard
                .as_mut()
                .ok_or_else(|| anyhow!("Shell session unavailable"))?;

            let mut forward = |line: &str| {
                if let Some(tx) = &sink {
                    if tx.send(line.to_string()).is_err() {
                        debug!("Output receiver dropped");
                    }
                }
            };
            session.execute(&cmd, Some(&mut forward))
        })
        .await;

        let outcome = match joined.map_err(anyhow::Error::from).and_then(|r| r) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Execution of '{}' failed: {:#}", command, e);
                self.audit.record(AuditEntry::Error(ErrorAudit {
                    timestamp: audit_timestamp(),
                    command: command.to_string(),
                    error: format!("{:#}", e),
                    traceback: format!("{:?}", e),
                }));
                return Err(GateError::Unexpected(e));
            }
        };

        let result = CommandResult::from_outcome(outcome);
        self.audit.record(AuditEntry::Command(CommandAudit {
            timestamp: audit_timestamp(),
            command: command.to_string(),
            success: result.success,
            is_override,
            timeout: result.timeout,
            timeout_reason: result.timeout_reason,
        }));
        Ok(result)
    }
}

fn lock_session(shell: &SharedSession) -> MutexGuard<'_, Option<ShellSession>> {
    // A panic mid-command leaves the session usable; the next restart replaces it.
    shell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
