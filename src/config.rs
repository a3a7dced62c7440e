use anyhow::Context as _;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::security::RateLimits;
use crate::shell::SessionSettings;

/// Phrase the human operator must type to approve a command.
pub const APPROVAL_PHRASE: &str = "I understand the risks and approve this command";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub shell: ShellConfig,
    pub permissions: PermissionsConfig,
    pub overrides: OverrideConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell binary; rc files are honoured
    pub path: String,
    pub idle_timeout_secs: f64,
    pub max_timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: default_shell(),
            idle_timeout_secs: 30.0,
            max_timeout_secs: 60.0,
            poll_interval_ms: 100,
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Supports ${ENV_VAR} substitution
    pub path: PathBuf,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("permission_config.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OverrideConfig {
    pub cooldown_secs: u64,
    pub max_per_hour: usize,
    pub min_reason_len: usize,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            max_per_hour: 10,
            min_reason_len: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Diagnostic logs and audit streams both live here
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

impl ShellConfig {
    /// Fails on negative, NaN, infinite or overflowing timeouts.
    pub fn session_settings(&self) -> anyhow::Result<SessionSettings> {
        Ok(SessionSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            idle_timeout: seconds("shell.idle_timeout_secs", self.idle_timeout_secs)?,
            max_timeout: seconds("shell.max_timeout_secs", self.max_timeout_secs)?,
        })
    }
}

fn seconds(key: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{} must be a finite, non-negative number of seconds (got {})", key, value))
}

impl OverrideConfig {
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_per_hour: self.max_per_hour,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${HOME}
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.shell.session_settings()?;
        Ok(config)
    }
}
