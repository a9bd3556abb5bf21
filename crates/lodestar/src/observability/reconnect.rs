//! Watch Reconnection Policy
//!
//! Bounds how often a discovery machine re-opens a watch stream that ended.
//!
//! Features:
//! - Maximum reconnect attempts within a sliding time window
//! - Exponential backoff between attempts
//! - Reset after a stream delivers events again

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Policy for re-opening lost watch streams
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnects within the time window
    pub max_attempts: u32,
    /// Time window for counting reconnects
    pub window: Duration,
    /// Initial backoff before reconnecting
    pub backoff: Duration,
    /// Maximum backoff before reconnecting
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, window: Duration, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            window,
            backoff,
            max_backoff,
        }
    }
}

/// Tracks reconnect history for a single watch
#[derive(Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    /// Timestamps of recent reconnects (within window)
    attempt_times: VecDeque<Instant>,
    /// Consecutive reconnects without a delivered event
    consecutive: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt_times: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Record a reconnect attempt.
    ///
    /// Returns `Some(backoff)` to wait before reconnecting, or `None` once the
    /// attempt limit for the window is exhausted.
    pub fn record_attempt(&mut self) -> Option<Duration> {
        let now = Instant::now();

        if let Some(cutoff) = now.checked_sub(self.policy.window) {
            while let Some(front) = self.attempt_times.front() {
                if *front < cutoff {
                    self.attempt_times.pop_front();
                } else {
                    break;
                }
            }
        }

        if self.attempt_times.len() >= self.policy.max_attempts as usize {
            return None;
        }

        self.attempt_times.push_back(now);
        self.consecutive += 1;

        Some(self.backoff())
    }

    fn backoff(&self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.consecutive.saturating_sub(1));
        self.policy
            .backoff
            .saturating_mul(multiplier)
            .min(self.policy.max_backoff)
    }

    /// Reset the backoff after the watch delivered events again
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Number of reconnects within the current window
    pub fn attempts(&self) -> usize {
        self.attempt_times.len()
    }
}
