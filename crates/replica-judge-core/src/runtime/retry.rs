// crates/replica-judge-core/src/runtime/retry.rs
// ============================================================================
// Module: Contention Retry
// Description: Bounded exponential backoff for transient store contention.
// Purpose: Retry claim and commit conflicts a fixed number of times before
//          deferring the work to the next pass.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Only errors the caller classifies as transient are retried. Delays double
//! per attempt up to a ceiling. Exhaustion returns the last error so the
//! caller can defer.

use std::thread;
use std::time::Duration;

/// Bounded retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Delay ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Returns the delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Runs `operation`, retrying while `is_transient` holds for its error.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once retries are exhausted.
    pub fn run<T, E>(
        &self,
        mut operation: impl FnMut() -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
