use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ConfigError, Error, Result};

/// Computes the next fire time for a 6-field cron expression, strictly after
/// `after`. This is the real parser/evaluator required by §4.1 — no
/// hand-rolled `*/N` subset is acceptable here.
pub fn compute_next_run(cron_expression: &str, timezone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = Schedule::from_str(cron_expression).ok()?;
    let tz: chrono_tz::Tz = timezone.parse().ok()?;
    let reference = after.with_timezone(&tz);
    schedule.after(&reference).next().map(|dt| dt.with_timezone(&Utc))
}

pub fn validate_cron_expression(cron_expression: &str, timezone: &str) -> Result<()> {
    Schedule::from_str(cron_expression)
        .map_err(|e| ConfigError::Validation(format!("invalid cron expression: {e}")))?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| ConfigError::Validation(format!("invalid timezone: {timezone}")))?;
    let schedule = Schedule::from_str(cron_expression).unwrap();
    let reference = Utc::now().with_timezone(&tz);
    if schedule.after(&reference).next().is_none() {
        return Err(Error::Config(ConfigError::Validation(
            "cron expression has no occurrence in the next scheduling window".into(),
        )));
    }
    Ok(())
}

/// A single trigger tick, carrying the fire time it was computed for (not
/// wall-clock-now at emit time — see §4.1's drift note).
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub fire_time: DateTime<Utc>,
}

/// C1: evaluates the cron expression and emits coalesced trigger ticks. At
/// most one tick is buffered (capacity 1 channel) so a slow-draining
/// consumer never piles up multiple pending triggers.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    cron_expression: String,
    timezone: String,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, cron_expression: impl Into<String>, timezone: impl Into<String>) -> Result<Self> {
        let cron_expression = cron_expression.into();
        let timezone = timezone.into();
        validate_cron_expression(&cron_expression, &timezone)?;
        Ok(Self { clock, cron_expression, timezone })
    }

    /// Runs the trigger loop until `shutdown` is notified. Emitted ticks are
    /// sent on `tx`; if the previous tick hasn't been drained yet the new
    /// one replaces it rather than blocking (coalescing, per §4.1).
    pub async fn run(self, tx: mpsc::Sender<Tick>, shutdown: Arc<Notify>) {
        let mut after = self.clock.now();
        loop {
            let Some(fire_time) = compute_next_run(&self.cron_expression, &self.timezone, after) else {
                warn!("scheduler could not compute next fire time, stopping");
                return;
            };
            debug!(%fire_time, "scheduler computed next fire time");
            if !self.clock.sleep_until(fire_time, &shutdown).await {
                info!("scheduler observed shutdown, exiting without a final tick");
                return;
            }
            match tx.try_send(Tick { fire_time }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("previous tick still pending, coalescing");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("trigger channel closed, scheduler exiting");
                    return;
                }
            }
            after = fire_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_next_occurrence_after_reference() {
        let after = Utc::now();
        let next = compute_next_run("0 * * * * *", "UTC", after).expect("should compute next run");
        assert!(next > after);
        assert!((next - after).num_seconds() <= 60);
    }

    #[test]
    fn rejects_unparseable_expression() {
        assert!(validate_cron_expression("not a cron", "UTC").is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(validate_cron_expression("0 * * * * *", "Not/AZone").is_err());
    }

    #[test]
    fn honors_step_and_range_syntax() {
        let after = Utc::now();
        let next = compute_next_run("0 */15 * * * *", "UTC", after).expect("should compute next run");
        assert_eq!(next.timestamp() % 900, 0);
    }
}
