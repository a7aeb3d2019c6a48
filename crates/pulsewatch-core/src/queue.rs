use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::models::{JobStatus, ProbeJob};
use crate::retry::{RetryAttempt, RetryPolicy};

/// C2: a priority-ordered, FIFO-within-priority queue of `ProbeJob`s.
///
/// Internally a plain `Vec` guarded by a mutex — the queue depth this
/// service deals with (one batch of targets per tick) never justifies a
/// lock-free structure; see §5 ("a single mutex is acceptable").
pub struct JobQueue {
    jobs: Mutex<HashMap<Uuid, ProbeJob>>,
    ready: Notify,
    max_depth: usize,
}

impl JobQueue {
    pub fn new(max_depth: usize) -> Self {
        Self { jobs: Mutex::new(HashMap::new()), ready: Notify::new(), max_depth }
    }

    /// Idempotent by job id: enqueuing the same id twice is a no-op on the
    /// second call.
    pub async fn enqueue(&self, job: ProbeJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Ok(());
        }
        if jobs.values().filter(|j| j.status == JobStatus::Queued).count() >= self.max_depth {
            return Err(QueueError::ResourceExhausted.into());
        }
        jobs.insert(job.id, job);
        drop(jobs);
        self.ready.notify_one();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        // best-effort, used only for metrics/backpressure decisions
        self.jobs.try_lock().map(|g| g.values().filter(|j| j.status == JobStatus::Queued).count()).unwrap_or(0)
    }

    /// Returns the highest-priority ready job (lower `priority` value = more
    /// urgent), breaking ties by older `scheduled_at`, then by job id. Marks
    /// it `Running` before returning it. Returns `None` if nothing is ready
    /// right now (callers loop on the `ready` notification themselves).
    pub async fn dequeue_ready(&self, now: DateTime<Utc>) -> Option<ProbeJob> {
        let mut jobs = self.jobs.lock().await;
        let candidate_id = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.is_ready(now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|j| j.id)?;

        let job = jobs.get_mut(&candidate_id).unwrap();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Some(job.clone())
    }

    pub async fn wait_for_ready(&self) {
        self.ready.notified().await;
    }

    /// Cancels a Queued job. Returns `Ok(true)` if it was cancelled,
    /// `Ok(false)` if it was already terminal/cancelled (idempotent, per
    /// §8's idempotence laws), or an error if the job is currently Running
    /// (can't cancel in-flight work this way).
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match job.status {
            JobStatus::Cancelled => Ok(false),
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            JobStatus::Running => Err(QueueError::InvalidState(id).into()),
            JobStatus::Completed | JobStatus::Failed => Ok(false),
        }
    }

    pub async fn mark_cancelled_in_place(&self, id: Uuid, now: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
        }
    }

    pub async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>, status: crate::models::ResultStatus, message: String) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.result_status = Some(status);
            job.result_message = Some(message);
        }
    }

    /// Requeues a failed job with exponential backoff (§4.2). Only valid
    /// while the job still has retries remaining under `policy`; otherwise
    /// the job is left Failed for the caller to dead-letter. `error_message`
    /// is recorded in the job's `retry_history` regardless of outcome, so a
    /// job that ultimately dead-letters still carries every attempt that led
    /// there.
    pub async fn requeue_with_backoff(&self, id: Uuid, policy: &RetryPolicy, now: DateTime<Utc>, error_message: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.retry_count >= job.max_retries.min(policy.max_retries) {
            job.status = JobStatus::Failed;
            job.retry_history.add_attempt(RetryAttempt {
                attempt: job.retry_count,
                error_message: error_message.to_string(),
                delay_ms: 0,
                attempted_at: now,
            });
            return Ok(false);
        }
        job.retry_count += 1;
        job.status = JobStatus::Queued;
        let delay = policy.backoff.calculate_delay(job.retry_count);
        job.next_retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
        job.started_at = None;
        job.retry_history.add_attempt(RetryAttempt {
            attempt: job.retry_count,
            error_message: error_message.to_string(),
            delay_ms: delay.as_millis() as u64,
            attempted_at: now,
        });
        drop(jobs);
        self.ready.notify_one();
        Ok(true)
    }

    /// `retry_job` from §6: only valid on Failed jobs, resets
    /// `next_retry_at` to now so the job becomes immediately ready again.
    pub async fn retry_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState(id).into());
        }
        job.status = JobStatus::Queued;
        job.next_retry_at = Some(now);
        drop(jobs);
        self.ready.notify_one();
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<ProbeJob> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

pub type SharedJobQueue = Arc<JobQueue>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeJob;

    fn job(priority: u8, scheduled_at: DateTime<Utc>) -> ProbeJob {
        ProbeJob::new_http("svc", priority, scheduled_at, 3)
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_by_id() {
        let queue = JobQueue::new(100);
        let j = job(5, Utc::now());
        queue.enqueue(j.clone()).await.unwrap();
        queue.enqueue(j.clone()).await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn dequeue_picks_highest_priority_first() {
        let queue = JobQueue::new(100);
        let now = Utc::now();
        queue.enqueue(job(5, now)).await.unwrap();
        let urgent = job(1, now);
        let urgent_id = urgent.id;
        queue.enqueue(urgent).await.unwrap();

        let dequeued = queue.dequeue_ready(now).await.unwrap();
        assert_eq!(dequeued.id, urgent_id);
    }

    #[tokio::test]
    async fn ties_broken_by_older_scheduled_at_then_id() {
        let queue = JobQueue::new(100);
        let now = Utc::now();
        let older = job(5, now - chrono::Duration::seconds(10));
        let older_id = older.id;
        let newer = job(5, now);
        queue.enqueue(newer).await.unwrap();
        queue.enqueue(older).await.unwrap();

        let dequeued = queue.dequeue_ready(now).await.unwrap();
        assert_eq!(dequeued.id, older_id);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let queue = JobQueue::new(100);
        let j = job(5, Utc::now());
        let id = j.id;
        queue.enqueue(j).await.unwrap();
        assert!(queue.cancel(id).await.unwrap());
        assert!(!queue.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn cannot_cancel_running_job() {
        let queue = JobQueue::new(100);
        let now = Utc::now();
        let j = job(5, now);
        let id = j.id;
        queue.enqueue(j).await.unwrap();
        queue.dequeue_ready(now).await.unwrap();
        assert!(queue.cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn requeue_with_backoff_sets_future_retry_time() {
        let queue = JobQueue::new(100);
        let now = Utc::now();
        let j = job(5, now);
        let id = j.id;
        queue.enqueue(j).await.unwrap();
        queue.dequeue_ready(now).await.unwrap();
        let policy = RetryPolicy::default();
        let requeued = queue.requeue_with_backoff(id, &policy, now, "connection reset").await.unwrap();
        assert!(requeued);
        let job = queue.get(id).await.unwrap();
        assert!(job.next_retry_at.unwrap() > now);
        assert!(!job.is_ready(now));
        assert_eq!(job.retry_history.attempt_count(), 1);
        assert_eq!(job.retry_history.last_error(), Some("connection reset"));
    }

    #[tokio::test]
    async fn max_queue_depth_is_enforced() {
        let queue = JobQueue::new(1);
        queue.enqueue(job(5, Utc::now())).await.unwrap();
        let err = queue.enqueue(job(5, Utc::now())).await;
        assert!(err.is_err());
    }
}
