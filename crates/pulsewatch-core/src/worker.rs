use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classifier::{classify, RawOutcome};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::dead_letter::DeadLetterSpill;
use crate::error::{Error, Result};
use crate::fanout::{Broadcaster, SubscriptionHandle};
use crate::governor::Governor;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::models::{Event, EventPayload, ProbeJob, ProbeKind, ResultRecord, Subscriber, WorkerInstanceRecord, WorkerStatus};
use crate::probes::{HttpProbeExecutor, SqlProbeExecutor};
use crate::queue::{JobQueue, SharedJobQueue};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, Tick};
use crate::store::{ResultFilter, Store, StoreWriter};

const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_JOB_PRIORITY: u8 = 5;

/// C10: owns every other component and drives it through the Starting →
/// Running → Stopping → Stopped/Error lifecycle (§4.10). Constructed once
/// per process; a crash in Starting terminates the process rather than
/// retrying in place — a supervisor outside the core restarts it with a
/// fresh instance record, per §4.10's Error-state note.
pub struct Worker {
    instance: WorkerInstanceRecord,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    queue: SharedJobQueue,
    governor: Arc<Governor>,
    http_executor: Arc<HttpProbeExecutor>,
    sql_executor: Arc<SqlProbeExecutor>,
    metrics: Arc<MetricsAggregator>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn Store>,
    store_writer: Arc<StoreWriter>,
    status: RwLock<WorkerStatus>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        environment: impl Into<String>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
    ) -> Arc<Self> {
        let cfg = config.current();
        let now = clock.now();

        let instance = WorkerInstanceRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.into(),
            status: WorkerStatus::Starting,
            started_at: now,
            stopped_at: None,
            last_heartbeat: now,
            tags: vec![],
        };

        let metrics = Arc::new(MetricsAggregator::new());
        let broadcaster = Arc::new(Broadcaster::new(metrics.clone(), cfg.subscriber_buffer_size));
        let governor = Arc::new(Governor::new(cfg.max_concurrent_http, cfg.max_concurrent_db, Duration::from_secs(cfg.default_timeout_seconds)));
        let http_executor = Arc::new(HttpProbeExecutor::new(Duration::from_secs(cfg.default_timeout_seconds)));
        SqlProbeExecutor::install_drivers();
        let sql_executor = Arc::new(SqlProbeExecutor::new(Duration::from_secs(cfg.default_timeout_seconds)));
        let queue: SharedJobQueue = Arc::new(JobQueue::new(cfg.queue_max_depth));
        let spill = Arc::new(DeadLetterSpill::new(cfg.dead_letter_spill_path.clone()));
        let store_writer = Arc::new(StoreWriter::spawn(instance.id, store.clone(), spill, Duration::from_millis(500), 100));

        Arc::new(Self {
            instance,
            config,
            clock,
            queue,
            governor,
            http_executor,
            sql_executor,
            metrics,
            broadcaster,
            store,
            store_writer,
            status: RwLock::new(WorkerStatus::Starting),
        })
    }

    pub fn id(&self) -> Uuid {
        self.instance.id
    }

    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        self.metrics.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn queue(&self) -> SharedJobQueue {
        self.queue.clone()
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.read().await
    }

    pub fn config(&self) -> ConfigHandle {
        self.config.clone()
    }

    /// `trigger_all` from §6: enqueues one out-of-band job per enabled
    /// endpoint and connection/query pair, outside the cron schedule.
    /// Returns the ids of the jobs that were actually enqueued; stops and
    /// returns what it has so far if the queue is full.
    pub async fn trigger_all(&self) -> Result<Vec<uuid::Uuid>> {
        let cfg = self.config.current();
        let now = self.clock.now();
        let mut ids = Vec::new();

        for endpoint in cfg.endpoints.iter().filter(|e| e.enabled) {
            let job = ProbeJob::new_http(endpoint.name.clone(), DEFAULT_JOB_PRIORITY, now, cfg.job_max_retries);
            self.queue.enqueue(job.clone()).await?;
            ids.push(job.id);
        }
        for connection in cfg.connections.iter().filter(|c| c.enabled) {
            for query in &connection.queries {
                let job = ProbeJob::new_sql(connection.name.clone(), query.name.clone(), DEFAULT_JOB_PRIORITY, now, cfg.job_max_retries);
                self.queue.enqueue(job.clone()).await?;
                ids.push(job.id);
            }
        }
        Ok(ids)
    }

    /// `trigger_target` from §6: enqueues an out-of-band job for a single
    /// named endpoint, or one job per query on a single named connection.
    pub async fn trigger_target(&self, name: &str) -> Result<Vec<uuid::Uuid>> {
        let cfg = self.config.current();
        let now = self.clock.now();
        let mut ids = Vec::new();

        if let Some(endpoint) = cfg.endpoints.iter().find(|e| e.name == name && e.enabled) {
            let job = ProbeJob::new_http(endpoint.name.clone(), DEFAULT_JOB_PRIORITY, now, cfg.job_max_retries);
            self.queue.enqueue(job.clone()).await?;
            ids.push(job.id);
            return Ok(ids);
        }

        if let Some(connection) = cfg.connections.iter().find(|c| c.name == name && c.enabled) {
            for query in &connection.queries {
                let job = ProbeJob::new_sql(connection.name.clone(), query.name.clone(), DEFAULT_JOB_PRIORITY, now, cfg.job_max_retries);
                self.queue.enqueue(job.clone()).await?;
                ids.push(job.id);
            }
            return Ok(ids);
        }

        Err(Error::NotFound(format!("no enabled endpoint or connection named '{name}'")))
    }

    /// `cancel_job` from §6: idempotent, transitions Queued -> Cancelled.
    pub async fn cancel_job(&self, id: uuid::Uuid) -> Result<bool> {
        self.queue.cancel(id).await
    }

    /// `retry_job` from §6: only valid on Failed jobs.
    pub async fn retry_job(&self, id: uuid::Uuid) -> Result<()> {
        self.queue.retry_job(id, self.clock.now()).await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// `list_results` from §6. Page size is clamped to <= 200 by `SqlStore`
    /// itself; this just forwards the already-validated filter.
    pub async fn list_results(&self, filter: ResultFilter) -> Result<Vec<ResultRecord>> {
        Ok(self.store.read_results(&filter).await?)
    }

    /// `subscribe` from §6: the handle is released (unsubscribed on the next
    /// publish) when the caller drops its receiver.
    pub async fn subscribe(&self, subscriber: Subscriber) -> SubscriptionHandle {
        self.broadcaster.subscribe(subscriber).await
    }

    /// Runs the worker until `shutdown` is notified, then drains and stops.
    /// Returns once the Stopped transition has been durably recorded.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) -> Result<()> {
        if let Err(e) = self.enter_starting().await {
            self.enter_error(&e.to_string()).await;
            return Err(e);
        }

        self.enter_running().await;

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let cfg = self.config.current();
        let scheduler = match Scheduler::new(self.clock.clone(), cfg.cron_schedule.clone(), cfg.timezone.clone()) {
            Ok(s) => s,
            Err(e) => {
                self.enter_error(&e.to_string()).await;
                return Err(e);
            }
        };

        let scheduler_shutdown = Arc::new(Notify::new());
        let scheduler_task = tokio::spawn(scheduler.run(tick_tx, scheduler_shutdown.clone()));

        let dispatch_shutdown = Arc::new(Notify::new());
        let dispatch_task = {
            let worker = self.clone();
            let dispatch_shutdown = dispatch_shutdown.clone();
            tokio::spawn(async move { worker.dispatch_loop(dispatch_shutdown).await })
        };

        let expand_task = {
            let worker = self.clone();
            tokio::spawn(async move { worker.expand_ticks(tick_rx).await })
        };

        let heartbeat_shutdown = Arc::new(Notify::new());
        let heartbeat_task = {
            let worker = self.clone();
            let heartbeat_shutdown = heartbeat_shutdown.clone();
            tokio::spawn(async move { worker.heartbeat_loop(heartbeat_shutdown).await })
        };

        let janitor_shutdown = Arc::new(Notify::new());
        let janitor_task = {
            let worker = self.clone();
            let janitor_shutdown = janitor_shutdown.clone();
            tokio::spawn(async move { worker.janitor_loop(janitor_shutdown).await })
        };

        shutdown.notified().await;
        self.enter_stopping().await;

        scheduler_shutdown.notify_one();
        heartbeat_shutdown.notify_one();
        janitor_shutdown.notify_one();
        let _ = scheduler_task.await;
        drop(expand_task);

        let deadline = Duration::from_secs(cfg.shutdown_deadline_seconds);
        dispatch_shutdown.notify_one();
        if tokio::time::timeout(deadline, dispatch_task).await.is_err() {
            warn!("dispatch loop did not drain within shutdown_deadline_seconds");
        }
        let _ = heartbeat_task.await;
        let _ = janitor_task.await;

        self.store_writer.flush_now().await;
        self.enter_stopped().await;
        Ok(())
    }

    async fn enter_starting(&self) -> Result<()> {
        *self.status.write().await = WorkerStatus::Starting;
        self.store.register_instance(&self.instance).await?;
        Ok(())
    }

    async fn enter_running(&self) {
        *self.status.write().await = WorkerStatus::Running;
        let _ = self.store.update_instance_status(self.instance.id, WorkerStatus::Running, None).await;
        self.emit_status_event(WorkerStatus::Running).await;
        info!(instance = %self.instance.id, "worker running");
    }

    async fn enter_stopping(&self) {
        *self.status.write().await = WorkerStatus::Stopping;
        let _ = self.store.update_instance_status(self.instance.id, WorkerStatus::Stopping, None).await;
        self.emit_status_event(WorkerStatus::Stopping).await;
        info!(instance = %self.instance.id, "worker stopping");
    }

    async fn enter_stopped(&self) {
        *self.status.write().await = WorkerStatus::Stopped;
        let now = self.clock.now();
        let _ = self.store.update_instance_status(self.instance.id, WorkerStatus::Stopped, Some(now)).await;
        self.emit_status_event(WorkerStatus::Stopped).await;
        info!(instance = %self.instance.id, "worker stopped");
    }

    async fn enter_error(&self, reason: &str) {
        *self.status.write().await = WorkerStatus::Error;
        let now = self.clock.now();
        let _ = self.store.update_instance_status(self.instance.id, WorkerStatus::Error, Some(now)).await;
        self.emit_status_event(WorkerStatus::Error).await;
        error!(instance = %self.instance.id, %reason, "worker entered error state");
    }

    async fn emit_status_event(&self, status: WorkerStatus) {
        self.broadcaster
            .publish(Event {
                event_id: Uuid::new_v4(),
                occurred_at: self.clock.now(),
                payload: EventPayload::WorkerStatus { instance_id: self.instance.id, status },
            })
            .await;
    }

    /// Turns each coalesced trigger tick into one job per enabled endpoint
    /// and one job per enabled connection/query pair (§4.1/§4.2). If the
    /// queue is over `max_queue_depth` the tick is skipped and
    /// `queue_overflow_total` is incremented, per §5's backpressure policy.
    async fn expand_ticks(&self, mut tick_rx: mpsc::Receiver<Tick>) {
        while let Some(tick) = tick_rx.recv().await {
            let cfg = self.config.current();
            let mut skipped = false;

            for endpoint in cfg.endpoints.iter().filter(|e| e.enabled) {
                let job = ProbeJob::new_http(endpoint.name.clone(), DEFAULT_JOB_PRIORITY, tick.fire_time, cfg.job_max_retries);
                if self.queue.enqueue(job).await.is_err() {
                    skipped = true;
                    break;
                }
            }

            if !skipped {
                for connection in cfg.connections.iter().filter(|c| c.enabled) {
                    for query in &connection.queries {
                        let job = ProbeJob::new_sql(connection.name.clone(), query.name.clone(), DEFAULT_JOB_PRIORITY, tick.fire_time, cfg.job_max_retries);
                        if self.queue.enqueue(job).await.is_err() {
                            skipped = true;
                            break;
                        }
                    }
                    if skipped {
                        break;
                    }
                }
            }

            if skipped {
                self.metrics.record_queue_overflow();
                warn!("queue over max_queue_depth, skipping this trigger tick");
            }
        }
    }

    /// Single worker loop (§5): dequeues ready jobs and spawns their
    /// dispatch, bounded by the Governor's semaphores rather than by this
    /// loop itself. Honors `dispatch_shutdown` for the drain-on-stop phase.
    async fn dispatch_loop(self: Arc<Self>, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                job = self.queue.dequeue_ready(self.clock.now()) => {
                    if let Some(job) = job {
                        let worker = self.clone();
                        tokio::spawn(async move { worker.execute_job(job).await });
                    } else {
                        tokio::select! {
                            _ = self.queue.wait_for_ready() => {}
                            _ = shutdown.notified() => return,
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        }
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }

    async fn execute_job(&self, job: ProbeJob) {
        let cfg = self.config.current();
        let job_shutdown = Notify::new();
        let started = self.clock.now();
        self.metrics.record_started(&job.target_name, job.kind);

        let (raw_outcome, accepted_codes, query, environment) = match job.kind {
            ProbeKind::Http => {
                let Some(endpoint) = cfg.endpoints.iter().find(|e| e.name == job.target_name) else {
                    self.fail_job_target_removed(job).await;
                    return;
                };
                let _permit = match self.governor.acquire_http().await {
                    Ok(p) => p,
                    Err(e) => {
                        self.requeue_or_fail(job, &e.to_string()).await;
                        return;
                    }
                };
                let outcome = self.http_executor.execute(endpoint, &job_shutdown).await;
                (outcome, endpoint.accepted_status_codes.clone(), None, endpoint.environment.clone())
            }
            ProbeKind::Database => {
                let Some(connection) = cfg.connections.iter().find(|c| c.name == job.target_name) else {
                    self.fail_job_target_removed(job).await;
                    return;
                };
                let Some(query) = job.query_name.as_ref().and_then(|qn| connection.queries.iter().find(|q| &q.name == qn)) else {
                    self.fail_job_target_removed(job).await;
                    return;
                };
                let _permit = match self.governor.acquire_sql(&connection.name, connection.serialize).await {
                    Ok(p) => p,
                    Err(e) => {
                        self.requeue_or_fail(job, &e.to_string()).await;
                        return;
                    }
                };
                let outcome = self.sql_executor.execute(connection, query, &job_shutdown).await;
                (outcome, Vec::new(), Some(query.clone()), connection.environment.clone())
            }
        };

        if let RawOutcome::Error(crate::error::ProbeError::Cancelled) = &raw_outcome {
            let now = self.clock.now();
            self.queue.mark_cancelled_in_place(job.id, now).await;
            return;
        }

        let classification = classify(&raw_outcome, &accepted_codes, query.as_ref());
        let completed = self.clock.now();
        let duration_ms = (completed - started).num_milliseconds().max(0) as u64;

        self.metrics.record_result(&job.target_name, job.kind, classification.status, duration_ms);
        self.queue.mark_completed(job.id, completed, classification.status, classification.message.clone()).await;

        let sql_meta = raw_outcome.sql_meta();
        let result = ResultRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            target_name: job.target_name.clone(),
            query_name: job.query_name.clone(),
            kind: job.kind,
            status: classification.status,
            message: classification.message.clone(),
            raw_value: raw_outcome.raw_value_string(),
            duration_ms,
            environment,
            server_version: sql_meta.and_then(|m| m.server_version.clone()),
            database_name: sql_meta.and_then(|m| m.database_name.clone()),
            tags: vec![],
            timestamp: completed,
        };

        let event_payload = match job.kind {
            ProbeKind::Http => EventPayload::Http(result.clone()),
            ProbeKind::Database => EventPayload::Database(result.clone()),
        };
        self.broadcaster.publish(Event { event_id: Uuid::new_v4(), occurred_at: completed, payload: event_payload }).await;

        self.store_writer.enqueue_result(result).await;

        if matches!(raw_outcome, RawOutcome::Error(_)) {
            let retry_policy = RetryPolicy { max_retries: cfg.job_max_retries, ..RetryPolicy::default() };
            let requeued = self.queue.requeue_with_backoff(job.id, &retry_policy, completed, &classification.message).await.unwrap_or(false);
            if let Some(updated) = self.queue.get(job.id).await {
                self.store_writer.enqueue_job_state(updated).await;
            }
            if !requeued {
                warn!(target = %job.target_name, "job exhausted retries and is now Failed");
            }
        } else if let Some(updated) = self.queue.get(job.id).await {
            self.store_writer.enqueue_job_state(updated).await;
        }
    }

    async fn fail_job_target_removed(&self, job: ProbeJob) {
        let now = self.clock.now();
        self.queue.mark_completed(job.id, now, crate::models::ResultStatus::Error, "target removed from configuration".to_string()).await;
        if let Some(updated) = self.queue.get(job.id).await {
            self.store_writer.enqueue_job_state(updated).await;
        }
    }

    async fn requeue_or_fail(&self, job: ProbeJob, reason: &str) {
        let cfg = self.config.current();
        let retry_policy = RetryPolicy { max_retries: cfg.job_max_retries, ..RetryPolicy::default() };
        let now = self.clock.now();
        warn!(target = %job.target_name, %reason, "could not acquire governor slot, requeuing");
        let _ = self.queue.requeue_with_backoff(job.id, &retry_policy, now, reason).await;
    }

    async fn heartbeat_loop(&self, shutdown: Arc<Notify>) {
        let interval = Duration::from_secs(self.config.current().heartbeat_interval_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = self.clock.now();
                    if let Err(e) = self.store.heartbeat(self.instance.id, now).await {
                        warn!(error = %e, "heartbeat write failed");
                    }
                    self.metrics.record_heartbeat();
                }
                _ = shutdown.notified() => return,
            }
        }
    }

    /// Retention sweep: periodically deletes job and result rows older than
    /// `data_retention_days`. A non-positive value disables the sweep
    /// (validated as a warning, not an error, in `config.rs`).
    async fn janitor_loop(&self, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                    let retention_days = self.config.current().data_retention_days;
                    if retention_days > 0 {
                        match self.store.delete_older_than(retention_days).await {
                            Ok(deleted) => info!(deleted, "janitor retention sweep completed"),
                            Err(e) => warn!(error = %e, "janitor retention sweep failed"),
                        }
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::EndpointTarget;
    use crate::store::SqlStore;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.cron_schedule = "* * * * * *".to_string();
        cfg.endpoints.push(EndpointTarget {
            name: "svc".into(),
            url: "http://127.0.0.1:1/health".into(),
            method: "GET".into(),
            timeout_seconds: Some(1),
            accepted_status_codes: vec![200],
            headers: HashMap::new(),
            environment: "test".into(),
            enabled: true,
            tags: vec![],
        });
        cfg
    }

    #[tokio::test]
    async fn worker_starts_and_stops_cleanly() {
        let config = ConfigHandle::new(test_config());
        let store: Arc<dyn Store> = Arc::new(SqlStore::connect("sqlite::memory:").await.unwrap());
        let clock = Arc::new(crate::clock::SystemClock);
        let worker = Worker::new("test-worker", "localhost", "test", config, clock, store);

        let shutdown = Arc::new(Notify::new());
        let worker_clone = worker.clone();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { worker_clone.run(shutdown_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.status().await, WorkerStatus::Running);

        shutdown.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.is_ok(), "worker did not shut down within timeout");
    }
}
