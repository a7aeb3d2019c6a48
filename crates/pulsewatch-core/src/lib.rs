pub mod classifier;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod fanout;
pub mod governor;
pub mod metrics;
pub mod models;
pub mod probes;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use classifier::{classify, Classification, RawOutcome};
pub use clock::{Clock, SystemClock};
pub use config::{Config, ConfigHandle, ValidationReport};
pub use dead_letter::{DeadLetterBatch, DeadLetterSpill};
pub use error::{ConfigError, Error, ProbeError, QueueError, Result, StoreError};
pub use fanout::{Broadcaster, SubscriptionHandle};
pub use governor::{Governor, GovernorPermit};
pub use metrics::{HistogramSnapshot, MetricsAggregator, MetricsSnapshot};
pub use models::{
    classify_instance_health, ComparisonOperator, ConnectionTarget, EndpointTarget, Event, EventPayload, InstanceHealth,
    JobStatus, ProbeJob, ProbeKind, QueryDefinition, QueryResultKind, ResultRecord, ResultStatus, SqlProvider, Subscriber,
    WorkerInstanceRecord, WorkerStatus,
};
pub use probes::{HttpProbeExecutor, SqlProbeExecutor};
pub use queue::{JobQueue, SharedJobQueue};
pub use retry::{ExponentialBackoff, RetryAttempt, RetryHistory, RetryPolicy};
pub use scheduler::{compute_next_run, validate_cron_expression, Scheduler, Tick};
pub use store::{job_is_terminal, ResultFilter, SqlStore, Store, StoreWriter};
pub use worker::Worker;

/// Current version of pulsewatch-core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
