//! Retry policy for transient handler failures.

use std::str::FromStr;
use std::time::Duration;

use crate::error::HandlerError;

/// How the delay grows with each attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// `base * attempt`: 30s, 60s, 90s with the default base.
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff '{other}', expected 'linear' or 'exponential'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. A job runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay` carrying `retry_count = attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Mark the job failed.
    GiveUp,
}

impl RetryPolicy {
    /// Decide the fate of a job whose attempt at `retry_count` failed with `error`.
    pub fn decide(&self, retry_count: u32, error: &HandlerError) -> RetryDecision {
        match error {
            HandlerError::Permanent(_) => RetryDecision::GiveUp,
            _ if retry_count >= self.max_retries => RetryDecision::GiveUp,
            _ => {
                let attempt = retry_count + 1;
                RetryDecision::Retry {
                    attempt,
                    delay: self.delay_for(attempt),
                }
            }
        }
    }

    /// Delay before the given retry attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}
