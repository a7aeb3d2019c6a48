use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Exponential backoff with jitter, per §7's defaults (base=1s, factor=2,
/// jitter=±20%, max=60s). Attempt 0 uses `initial_delay` directly; later
/// attempts multiply by `multiplier^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_secs = (self.initial_delay.as_secs_f64() * self.multiplier.powf(exponent)).min(self.max_delay.as_secs_f64());

        let jitter_range = delay_secs * self.jitter;
        let jitter = if self.jitter > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay_secs + jitter).max(0.0))
    }
}

/// One retry attempt recorded against a job, kept for observability and for
/// the dead-letter record's `retry_history` (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error_message: String,
    pub delay_ms: u64,
    pub attempted_at: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn new(attempt: u32, error: &ProbeError, delay: Duration) -> Self {
        Self {
            attempt,
            error_message: error.to_string(),
            delay_ms: delay.as_millis() as u64,
            attempted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RetryHistory {
    pub attempts: Vec<RetryAttempt>,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_attempt(&mut self, attempt: RetryAttempt) {
        self.attempts.push(attempt);
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error_message.as_str())
    }
}

/// Job-level retry policy: whether `error` warrants another attempt, and if
/// so, how long to wait given `attempt` and `max_retries`. This is
/// deliberately distinct from the HTTP transport circuit breaker
/// (`probes/http.rs`) — §9 calls out these as two layers that should not be
/// merged.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: ExponentialBackoff,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { backoff: ExponentialBackoff::default(), max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32, error: &ProbeError) -> bool {
        error.is_retriable() && attempt < self.max_retries
    }

    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.calculate_delay(attempt);
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }
}
