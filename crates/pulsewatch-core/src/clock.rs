use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Injected time source. Production code uses `SystemClock`; tests use
/// `FakeClock` so that scheduling logic can be exercised without real
/// wall-clock sleeps (§9: "inject Clock... no global singletons").
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps until `deadline`, or returns early if `shutdown` is notified.
    /// Returns `true` if the sleep completed normally, `false` if it was
    /// cut short by shutdown.
    async fn sleep_until(&self, deadline: DateTime<Utc>, shutdown: &Notify) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>, shutdown: &Notify) -> bool {
        let now = Utc::now();
        let remaining = (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => true,
            _ = shutdown.notified() => false,
        }
    }
}

#[cfg(test)]
pub struct FakeClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: std::sync::Mutex::new(start) }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard = *guard + duration;
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>, _shutdown: &Notify) -> bool {
        self.advance(deadline - self.now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_clock_advances_on_sleep() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        let notify = Notify::new();
        let completed = clock.sleep_until(start + chrono::Duration::seconds(60), &notify).await;
        assert!(completed);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }
}
