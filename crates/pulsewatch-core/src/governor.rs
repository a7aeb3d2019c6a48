use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::{QueueError, Result};

/// C3: bounds in-flight probes per resource class, and optionally serializes
/// all probes against a single SQL connection target.
///
/// `http_slots`/`db_slots` are global caps shared across all targets of that
/// kind. The per-connection mutex map is consulted only for targets whose
/// `ConnectionTarget::serialize` is true (§9.1's resolved default is
/// concurrent, i.e. most targets never touch this map).
pub struct Governor {
    http_slots: Arc<Semaphore>,
    db_slots: Arc<Semaphore>,
    serialize_locks: DashMap<String, Arc<Mutex<()>>>,
    acquire_ceiling: Duration,
}

pub enum GovernorPermit {
    Http(OwnedSemaphorePermit),
    Sql { _slot: OwnedSemaphorePermit, _serialize_guard: Option<tokio::sync::OwnedMutexGuard<()>> },
}

impl Governor {
    pub fn new(max_concurrent_http: usize, max_concurrent_db: usize, acquire_ceiling: Duration) -> Self {
        Self {
            http_slots: Arc::new(Semaphore::new(max_concurrent_http.max(1))),
            db_slots: Arc::new(Semaphore::new(max_concurrent_db.max(1))),
            serialize_locks: DashMap::new(),
            acquire_ceiling,
        }
    }

    pub async fn acquire_http(&self) -> Result<GovernorPermit> {
        let permit = tokio::time::timeout(self.acquire_ceiling, self.http_slots.clone().acquire_owned())
            .await
            .map_err(|_| QueueError::ResourceExhausted)?
            .expect("semaphore never closed");
        Ok(GovernorPermit::Http(permit))
    }

    pub async fn acquire_sql(&self, connection_name: &str, serialize: bool) -> Result<GovernorPermit> {
        let slot = tokio::time::timeout(self.acquire_ceiling, self.db_slots.clone().acquire_owned())
            .await
            .map_err(|_| QueueError::ResourceExhausted)?
            .expect("semaphore never closed");

        let serialize_guard = if serialize {
            let lock = self
                .serialize_locks
                .entry(connection_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = tokio::time::timeout(self.acquire_ceiling, lock.lock_owned())
                .await
                .map_err(|_| QueueError::ResourceExhausted)?;
            Some(guard)
        } else {
            None
        };

        Ok(GovernorPermit::Sql { _slot: slot, _serialize_guard: serialize_guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_slots_are_bounded() {
        let gov = Governor::new(1, 1, Duration::from_millis(50));
        let first = gov.acquire_http().await.unwrap();
        let second = gov.acquire_http().await;
        assert!(second.is_err());
        drop(first);
        assert!(gov.acquire_http().await.is_ok());
    }

    #[tokio::test]
    async fn serialized_sql_targets_do_not_overlap() {
        let gov = Arc::new(Governor::new(4, 4, Duration::from_millis(100)));
        let first = gov.acquire_sql("db-a", true).await.unwrap();
        let gov2 = gov.clone();
        let handle = tokio::spawn(async move { gov2.acquire_sql("db-a", true).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        drop(first);
        let second = handle.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn non_serialized_sql_targets_can_overlap() {
        let gov = Governor::new(4, 4, Duration::from_millis(50));
        let first = gov.acquire_sql("db-a", false).await.unwrap();
        let second = gov.acquire_sql("db-a", false).await;
        assert!(second.is_ok());
        drop(first);
    }
}
