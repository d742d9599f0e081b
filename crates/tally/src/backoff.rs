//! Reconnect gating: rate limit, attempt budget, cooldown.

use std::time::Duration;

use tokio::time::Instant;

/// Gate state for reconnect attempts.
///
/// All mutation happens under the session manager's connect lock; a
/// concurrent trigger observes `in_progress` and backs off without
/// touching anything else.
#[derive(Debug)]
pub struct BackoffGate {
    /// Minimum spacing between attempts.
    delay: Duration,
    /// Attempts permitted before the cooldown applies.
    max_attempts: u32,
    /// Window that must elapse, once the budget is spent, before the
    /// counter resets.
    cooldown: Duration,
    last_attempt: Option<Instant>,
    attempts_since_success: u32,
    in_progress: bool,
}

impl BackoffGate {
    pub fn new(delay: Duration, max_attempts: u32, cooldown_multiplier: u32) -> Self {
        Self {
            delay,
            max_attempts,
            cooldown: delay * cooldown_multiplier,
            last_attempt: None,
            attempts_since_success: 0,
            in_progress: false,
        }
    }

    /// Try to take the reconnect slot at `now`.
    ///
    /// Denied when another reconnect is in flight, when the last attempt
    /// was less than the base delay ago, or when the attempt budget is
    /// spent and the cooldown has not elapsed. A post-cooldown grant
    /// resets the attempt counter before counting itself.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.in_progress {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.delay {
                return false;
            }
            if self.attempts_since_success >= self.max_attempts {
                if now.duration_since(last) <= self.cooldown {
                    return false;
                }
                self.attempts_since_success = 0;
            }
        }
        self.in_progress = true;
        self.attempts_since_success += 1;
        self.last_attempt = Some(now);
        true
    }

    /// Release the slot after an attempt; success clears the budget.
    pub fn release(&mut self, success: bool) {
        if success {
            self.attempts_since_success = 0;
        }
        self.in_progress = false;
    }

    /// Clear the attempt budget after an out-of-band successful connect.
    pub fn reset_attempts(&mut self) {
        self.attempts_since_success = 0;
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn attempts_since_success(&self) -> u32 {
        self.attempts_since_success
    }
}
