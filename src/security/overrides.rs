//! Rate-limited safety overrides and the session allow set.
//!
//! An override lets the agent run an `always_ask` command after giving a
//! written reason. Overrides are throttled twice: a cooldown between
//! grants and a cap per sliding hour.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::base_command;
use crate::utils::clock::Clock;

const HOUR: Duration = Duration::from_secs(3600);

/// A granted override, kept for the life of the process.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideHistoryEntry {
    pub command: String,
    pub reason: String,
    pub timestamp: DateTime<Local>,
    #[serde(skip)]
    granted_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub cooldown: Duration,
    pub max_per_hour: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_per_hour: 10,
        }
    }
}

pub struct OverrideRateLimiter {
    limits: RateLimits,
    clock: Arc<dyn Clock>,
    session_allows: HashSet<String>,
    history: Vec<OverrideHistoryEntry>,
    last_grant: Option<Instant>,
    override_count: u64,
}

impl OverrideRateLimiter {
    pub fn new(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            session_allows: HashSet::new(),
            history: Vec::new(),
            last_grant: None,
            override_count: 0,
        }
    }

    /// Whether another override may be granted right now. Cooldown is
    /// checked before the hourly cap.
    pub fn check(&self) -> (bool, String) {
        let now = self.clock.now();

        if let Some(last) = self.last_grant {
            let since = now.saturating_duration_since(last);
            if since < self.limits.cooldown {
                let wait = self.limits.cooldown - since;
                return (false, format!("Rate limited. Wait {:.0}s", wait.as_secs_f64()));
            }
        }

        let recent = self
            .history
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.granted_at) < HOUR)
            .count();
        if recent >= self.limits.max_per_hour {
            return (
                false,
                format!(
                    "Hourly limit reached ({} overrides/hour)",
                    self.limits.max_per_hour
                ),
            );
        }

        (true, "OK".to_string())
    }

    /// Record a grant. Callers must have passed [`check`](Self::check) first.
    pub fn grant(&mut self, command: &str, reason: &str) {
        let now = self.clock.now();
        self.history.push(OverrideHistoryEntry {
            command: command.to_string(),
            reason: reason.to_string(),
            timestamp: Local::now(),
            granted_at: now,
        });
        self.last_grant = Some(now);
        self.override_count += 1;
        self.session_allows.insert(base_command(command));
    }

    pub fn allow_for_session(&mut self, base: &str) {
        self.session_allows.insert(base.to_string());
    }

    pub fn is_session_allowed(&self, base: &str) -> bool {
        self.session_allows.contains(base)
    }

    /// Drop every session allowance. History and throttling state survive.
    pub fn clear_session(&mut self) {
        self.session_allows.clear();
    }

    pub fn history(&self) -> &[OverrideHistoryEntry] {
        &self.history
    }

    pub fn override_count(&self) -> u64 {
        self.override_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    fn limiter(cooldown_secs: u64, max_per_hour: usize) -> (OverrideRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limits = RateLimits {
            cooldown: Duration::from_secs(cooldown_secs),
            max_per_hour,
        };
        (OverrideRateLimiter::new(limits, clock.clone()), clock)
    }

    #[test]
    fn test_fresh_limiter_allows() {
        let (mgr, _) = limiter(60, 10);
        let (allowed, msg) = mgr.check();
        assert!(allowed);
        assert_eq!(msg, "OK");
    }

    #[test]
    fn test_cooldown_after_grant() {
        let (mut mgr, clock) = limiter(60, 10);
        mgr.grant("rm -f build.log", &"x".repeat(60));

        clock.advance(Duration::from_secs(20));
        let (allowed, msg) = mgr.check();
        assert!(!allowed);
        assert_eq!(msg, "Rate limited. Wait 40s");

        clock.advance(Duration::from_secs(40));
        assert!(mgr.check().0);
    }

    #[test]
    fn test_hourly_cap() {
        let (mut mgr, clock) = limiter(1, 2);
        mgr.grant("rm a", "first");
        clock.advance(Duration::from_secs(2));
        assert!(mgr.check().0);
        mgr.grant("rm b", "second");
        clock.advance(Duration::from_secs(10));

        let (allowed, msg) = mgr.check();
        assert!(!allowed);
        assert!(msg.contains("Hourly limit"), "{msg}");
    }

    #[test]
    fn test_hourly_window_slides() {
        let (mut mgr, clock) = limiter(1, 2);
        mgr.grant("rm a", "first");
        clock.advance(Duration::from_secs(2));
        mgr.grant("rm b", "second");

        clock.advance(Duration::from_secs(3597));
        assert!(!mgr.check().0);
        clock.advance(Duration::from_secs(2));
        assert!(mgr.check().0);
        // History is never pruned, only windowed.
        assert_eq!(mgr.history().len(), 2);
    }

    #[test]
    fn test_grant_records_history_and_session_allow() {
        let (mut mgr, _) = limiter(60, 10);
        mgr.grant("/usr/bin/rm -f out.txt", "cleanup of generated artifacts");

        assert_eq!(mgr.override_count(), 1);
        assert_eq!(mgr.history()[0].command, "/usr/bin/rm -f out.txt");
        assert!(mgr.is_session_allowed("rm"));
    }

    #[test]
    fn test_clear_session_keeps_history() {
        let (mut mgr, _) = limiter(60, 10);
        mgr.grant("rm x", "reason");
        mgr.allow_for_session("git");

        mgr.clear_session();
        assert!(!mgr.is_session_allowed("rm"));
        assert!(!mgr.is_session_allowed("git"));
        assert_eq!(mgr.history().len(), 1);
        assert!(!mgr.check().0);
    }
}
