//! Restart policy engine
//!
//! Pure decision function: given a component's crash history, restart after
//! an exponential backoff or mark the component failed.
//!
//! **Backoff:** `delay = min(2^restart_count, cap)` seconds, where
//! `restart_count` is the number of crashes before the current one. The
//! sequence for consecutive crashes is therefore 1, 2, 4, 8, 16, 32, 60, 60, …
//!
//! **Limits** (either one terminates restarts):
//! - rapid-restart: more than `rapid_limit` crashes inside the trailing
//!   `rapid_window`
//! - lifetime: more than `lifetime_limit` crashes in total
//!
//! Counters live in [`CrashHistory`], owned by the supervisor's registry.
//! Pausing and resuming the pool never touches them; they clear only after
//! `healthy_reset_after` of continuous healthy operation or an operator reset.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Policy thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub rapid_window: Duration,
    pub rapid_limit: u32,
    pub lifetime_limit: u32,
    pub backoff_cap: Duration,
    pub healthy_reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            rapid_window: Duration::from_secs(300),
            rapid_limit: 5,
            lifetime_limit: 20,
            backoff_cap: Duration::from_secs(60),
            healthy_reset_after: Duration::from_secs(300),
        }
    }
}

/// Why a component was marked failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RapidRestartLimit { crashes: u32, window: Duration },
    LifetimeLimit { crashes: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RapidRestartLimit { crashes, window } => write!(
                f,
                "{} crashes within {}s exceeds the rapid-restart limit",
                crashes,
                window.as_secs()
            ),
            FailureReason::LifetimeLimit { crashes } => {
                write!(f, "{} crashes exceeds the lifetime restart limit", crashes)
            }
        }
    }
}

/// Outcome of [`RestartPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter(Duration),
    MarkFailed(FailureReason),
}

/// Crash counters for one component
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashHistory {
    /// Crashes since the last reset
    restart_count: u32,
    /// Crash instants, oldest first
    recent: VecDeque<Instant>,
}

impl CrashHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime crash count (since the last reset)
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Record a crash at `now`
    ///
    /// Entries older than `window` are pruned so the deque stays bounded by
    /// the rapid limit plus one.
    pub fn record_crash(&mut self, now: Instant, window: Duration) {
        self.restart_count = self.restart_count.saturating_add(1);
        self.recent.push_back(now);
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Crashes within the trailing `window` ending at `now`
    pub fn crashes_within(&self, window: Duration, now: Instant) -> u32 {
        self.recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= window)
            .count() as u32
    }

    /// Clear all counters (healthy period elapsed or operator action)
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.recent.clear();
    }
}

impl RestartPolicy {
    /// Decide what to do about the crash most recently recorded in `history`
    pub fn decide(&self, history: &CrashHistory, now: Instant) -> RestartDecision {
        let in_window = history.crashes_within(self.rapid_window, now);
        if in_window > self.rapid_limit {
            return RestartDecision::MarkFailed(FailureReason::RapidRestartLimit {
                crashes: in_window,
                window: self.rapid_window,
            });
        }

        let total = history.restart_count();
        if total > self.lifetime_limit {
            return RestartDecision::MarkFailed(FailureReason::LifetimeLimit { crashes: total });
        }

        RestartDecision::RestartAfter(self.backoff_for(total.saturating_sub(1)))
    }

    /// `min(2^prior_crashes, cap)`
    pub fn backoff_for(&self, prior_crashes: u32) -> Duration {
        // 2^6 already exceeds any sane cap; avoid overflow for large counts
        let exp = prior_crashes.min(32);
        let secs = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.backoff_cap)
    }

    /// Whether continuous health since `healthy_since` earns a counter reset
    pub fn should_reset(&self, healthy_since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(healthy_since) >= self.healthy_reset_after
    }
}
