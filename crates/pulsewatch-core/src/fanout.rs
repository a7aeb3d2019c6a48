use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::metrics::MetricsAggregator;
use crate::models::{Event, Subscriber};

/// C8: the event fan-out hub. Subscribers are a capability record (identity
/// + permissions + groups) mapped to an outbound `mpsc::Sender`; publish
/// takes a read lock, try-sends to each matching subscriber, and drops the
/// event for anyone whose buffer is full rather than ever blocking the
/// publisher. This mirrors the teacher's broadcast hub (`websocket/
/// broadcast.rs`), not the unrelated stub in `websocket/mod.rs`.
pub struct Broadcaster {
    subscribers: RwLock<std::collections::HashMap<Uuid, (Subscriber, mpsc::Sender<Event>)>>,
    metrics: Arc<MetricsAggregator>,
    buffer_size: usize,
}

pub struct SubscriptionHandle {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Event>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<MetricsAggregator>, buffer_size: usize) -> Self {
        Self { subscribers: RwLock::new(std::collections::HashMap::new()), metrics, buffer_size }
    }

    /// `subscribe` from §6. The returned handle's receiver is dropped by the
    /// caller on disconnect, at which point the next publish attempt
    /// observes a closed channel and prunes the entry.
    pub async fn subscribe(&self, subscriber: Subscriber) -> SubscriptionHandle {
        let id = subscriber.id;
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.write().await.insert(id, (subscriber, tx));
        SubscriptionHandle { id, receiver: rx }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
    }

    /// Delivers `event` to every subscriber authorized per §4.8: holds
    /// `view_monitoring`, and is joined to the event's group or the global
    /// group. Never blocks: a full outbound buffer drops this event for
    /// that subscriber only and increments `dropped_events_total`.
    pub async fn publish(&self, event: Event) {
        let group = event.group();
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, (subscriber, sender)) in subscribers.iter() {
                if !subscriber.has_permission("view_monitoring") || !subscriber.is_in_group(group) {
                    continue;
                }
                match sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = %id, "outbound buffer full, dropping event");
                        self.metrics.record_dropped_event(&id.to_string());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventPayload, ResultRecord, ResultStatus, ProbeKind};
    use chrono::Utc;

    fn sample_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload: EventPayload::Http(ResultRecord {
                id: Uuid::new_v4(),
                job_id: Uuid::new_v4(),
                target_name: "api".into(),
                query_name: None,
                kind: ProbeKind::Http,
                status: ResultStatus::Healthy,
                message: "HTTP 200 OK".into(),
                raw_value: None,
                duration_ms: 10,
                environment: "test".into(),
                server_version: None,
                database_name: None,
                tags: vec![],
                timestamp: Utc::now(),
            }),
        }
    }

    fn subscriber(groups: Vec<&str>, permissions: Vec<&str>) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            principal: "alice".into(),
            roles: vec![],
            permissions: permissions.into_iter().map(String::from).collect(),
            groups: groups.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn authorized_subscriber_in_matching_group_receives_event() {
        let metrics = Arc::new(MetricsAggregator::new());
        let hub = Broadcaster::new(metrics, 8);
        let sub = subscriber(vec!["http"], vec!["view_monitoring"]);
        let mut handle = hub.subscribe(sub).await;

        hub.publish(sample_event()).await;

        let received = handle.receiver.try_recv();
        assert!(received.is_ok());
    }

    #[tokio::test]
    async fn subscriber_without_permission_receives_nothing() {
        let metrics = Arc::new(MetricsAggregator::new());
        let hub = Broadcaster::new(metrics, 8);
        let sub = subscriber(vec!["http"], vec![]);
        let mut handle = hub.subscribe(sub).await;

        hub.publish(sample_event()).await;

        assert!(handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscriber_in_wrong_group_receives_nothing() {
        let metrics = Arc::new(MetricsAggregator::new());
        let hub = Broadcaster::new(metrics, 8);
        let sub = subscriber(vec!["database"], vec!["view_monitoring"]);
        let mut handle = hub.subscribe(sub).await;

        hub.publish(sample_event()).await;

        assert!(handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_event_and_increments_counter() {
        let metrics = Arc::new(MetricsAggregator::new());
        let hub = Broadcaster::new(metrics.clone(), 1);
        let sub_id;
        {
            let sub = subscriber(vec!["http"], vec!["view_monitoring"]);
            sub_id = sub.id;
            let _handle = hub.subscribe(sub).await; // receiver never drained
            hub.publish(sample_event()).await; // fills the buffer (size 1)
            hub.publish(sample_event()).await; // this one should drop
        }
        assert_eq!(metrics.dropped_events_for(&sub_id.to_string()), 1);
    }
}
