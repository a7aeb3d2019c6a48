use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::retry::RetryHistory;

/// Which family of probe a job/target/result belongs to. Used as the tag in
/// the dispatcher's tagged-variant design (no executor type hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    Database,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http => "http",
            ProbeKind::Database => "database",
        }
    }
}

/// An HTTP endpoint to be checked on schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointTarget {
    pub name: String,
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_accepted_status_codes")]
    pub accepted_status_codes: Vec<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub environment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_accepted_status_codes() -> Vec<u16> {
    vec![200]
}

fn default_true() -> bool {
    true
}

impl EndpointTarget {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("endpoint name must not be empty".into());
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| format!("invalid url: {e}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(format!("unsupported url scheme: {}", parsed.scheme()));
        }
        if self.accepted_status_codes.is_empty() {
            return Err("accepted_status_codes must not be empty".into());
        }
        if let Some(t) = self.timeout_seconds {
            if !(1..=300).contains(&t) {
                return Err("timeout_seconds must be between 1 and 300".into());
            }
        }
        Ok(())
    }
}

/// A SQL provider that a `ConnectionTarget` speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlProvider {
    Postgres,
    Mysql,
    Sqlite,
}

/// A database connection to be checked on schedule, via one or more
/// associated `QueryDefinition`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub name: String,
    pub provider: SqlProvider,
    pub connection_string: String,
    #[serde(default)]
    pub environment: String,
    pub connect_timeout_seconds: Option<u64>,
    pub command_timeout_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
    /// When true, probes against this target's pool never run concurrently
    /// with one another (§9.1 resolves the default to `false`).
    #[serde(default)]
    pub serialize: bool,
}

impl ConnectionTarget {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("connection name must not be empty".into());
        }
        if self.connection_string.trim().is_empty() {
            return Err("connection_string must not be empty".into());
        }
        for (label, secs) in [
            ("connect_timeout_seconds", self.connect_timeout_seconds),
            ("command_timeout_seconds", self.command_timeout_seconds),
        ] {
            if let Some(t) = secs {
                if !(1..=300).contains(&t) {
                    return Err(format!("{label} must be between 1 and 300"));
                }
            }
        }
        for query in &self.queries {
            query.validate().map_err(|e| format!("query '{}': {e}", query.name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryResultKind {
    Scalar,
    NonQuery,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// One SQL statement to run against a `ConnectionTarget`, plus the rule used
/// to classify its result (see `classifier.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub name: String,
    pub sql: String,
    pub result_kind: QueryResultKind,
    pub expected_value: Option<serde_json::Value>,
    pub comparison_operator: Option<ComparisonOperator>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub description: String,
}

impl QueryDefinition {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("query name must not be empty".into());
        }
        if self.sql.trim().is_empty() {
            return Err("query sql must not be empty".into());
        }
        if self.expected_value.is_some() != self.comparison_operator.is_some() {
            return Err("comparison_operator must be set iff expected_value is set".into());
        }
        if let (Some(w), Some(c)) = (self.warning_threshold, self.critical_threshold) {
            if c <= w {
                return Err("critical_threshold must be strictly greater than warning_threshold".into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A single scheduled (or retried) attempt to run one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeJob {
    pub id: Uuid,
    pub kind: ProbeKind,
    pub target_name: String,
    pub query_name: Option<String>,
    pub priority: u8,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result_status: Option<ResultStatus>,
    pub result_message: Option<String>,
    #[serde(default)]
    pub retry_history: RetryHistory,
}

impl ProbeJob {
    pub fn new_http(target_name: impl Into<String>, priority: u8, scheduled_at: DateTime<Utc>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ProbeKind::Http,
            target_name: target_name.into(),
            query_name: None,
            priority,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            result_status: None,
            result_message: None,
            retry_history: RetryHistory::new(),
        }
    }

    pub fn new_sql(
        target_name: impl Into<String>,
        query_name: impl Into<String>,
        priority: u8,
        scheduled_at: DateTime<Utc>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ProbeKind::Database,
            target_name: target_name.into(),
            query_name: Some(query_name.into()),
            priority,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            result_status: None,
            result_message: None,
            retry_history: RetryHistory::new(),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now && self.next_retry_at.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Healthy => "healthy",
            ResultStatus::Warning => "warning",
            ResultStatus::Critical => "critical",
            ResultStatus::Error => "error",
        }
    }
}

/// The immutable outcome of one probe attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_name: String,
    pub query_name: Option<String>,
    pub kind: ProbeKind,
    pub status: ResultStatus,
    pub message: String,
    pub raw_value: Option<String>,
    pub duration_ms: u64,
    pub environment: String,
    pub server_version: Option<String>,
    pub database_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// The single running worker instance this process owns (§9: the one
/// process-wide singleton permitted by design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstanceRecord {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub pid: u32,
    pub version: String,
    pub environment: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// External, read-only health classification of a `WorkerInstanceRecord`,
/// per §4.10 ("Running with stale heartbeat" logic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Warning,
    Critical,
}

pub fn classify_instance_health(
    record: &WorkerInstanceRecord,
    now: DateTime<Utc>,
    heartbeat_interval_seconds: i64,
) -> InstanceHealth {
    if record.status != WorkerStatus::Running {
        return InstanceHealth::Critical;
    }
    let age = (now - record.last_heartbeat).num_seconds();
    if age <= heartbeat_interval_seconds {
        InstanceHealth::Healthy
    } else if age <= heartbeat_interval_seconds * 2 {
        InstanceHealth::Warning
    } else {
        InstanceHealth::Critical
    }
}

/// A live subscriber to the event fan-out (C8). Not persisted.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: Uuid,
    pub principal: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub groups: Vec<String>,
}

impl Subscriber {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group || g == "global")
    }
}

/// The envelope delivered to subscribers (§6): every event carries a unique
/// id, a kind discriminating Results from lifecycle/metrics events, and the
/// payload itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Http(ResultRecord),
    Database(ResultRecord),
    WorkerStatus { instance_id: Uuid, status: WorkerStatus },
    Metrics(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn group(&self) -> &'static str {
        match &self.payload {
            EventPayload::Http(_) => "http",
            EventPayload::Database(_) => "database",
            EventPayload::WorkerStatus { .. } => "global",
            EventPayload::Metrics(_) => "global",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_rejects_bad_scheme() {
        let e = EndpointTarget {
            name: "x".into(),
            url: "ftp://example.com".into(),
            method: default_http_method(),
            timeout_seconds: None,
            accepted_status_codes: default_accepted_status_codes(),
            headers: HashMap::new(),
            environment: "test".into(),
            enabled: true,
            tags: vec![],
        };
        assert!(e.validate().is_err());
    }

    #[test]
    fn query_requires_operator_with_expected_value() {
        let q = QueryDefinition {
            name: "q".into(),
            sql: "select 1".into(),
            result_kind: QueryResultKind::Scalar,
            expected_value: Some(serde_json::json!(1)),
            comparison_operator: None,
            warning_threshold: None,
            critical_threshold: None,
            timeout_seconds: None,
            description: String::new(),
        };
        assert!(q.validate().is_err());
    }

    #[test]
    fn query_rejects_inverted_thresholds() {
        let q = QueryDefinition {
            name: "q".into(),
            sql: "select 1".into(),
            result_kind: QueryResultKind::Scalar,
            expected_value: None,
            comparison_operator: None,
            warning_threshold: Some(100.0),
            critical_threshold: Some(50.0),
            timeout_seconds: None,
            description: String::new(),
        };
        assert!(q.validate().is_err());
    }

    #[test]
    fn job_is_ready_respects_retry_timestamp() {
        let now = Utc::now();
        let mut job = ProbeJob::new_http("svc", 5, now - chrono::Duration::seconds(10), 3);
        assert!(job.is_ready(now));
        job.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_ready(now));
    }

    #[test]
    fn instance_health_classifies_by_heartbeat_age() {
        let now = Utc::now();
        let mut record = WorkerInstanceRecord {
            id: Uuid::new_v4(),
            name: "pulsewatch-1".into(),
            host: "localhost".into(),
            pid: 1,
            version: "0.1.0".into(),
            environment: "test".into(),
            status: WorkerStatus::Running,
            started_at: now,
            stopped_at: None,
            last_heartbeat: now,
            tags: vec![],
        };
        assert_eq!(classify_instance_health(&record, now, 30), InstanceHealth::Healthy);
        record.last_heartbeat = now - chrono::Duration::seconds(45);
        assert_eq!(classify_instance_health(&record, now, 30), InstanceHealth::Warning);
        record.last_heartbeat = now - chrono::Duration::seconds(90);
        assert_eq!(classify_instance_health(&record, now, 30), InstanceHealth::Critical);
    }
}
