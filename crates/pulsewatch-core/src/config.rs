use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{ConnectionTarget, EndpointTarget};

/// The published configuration view (C11). Every field maps to a single,
/// documented effect in the component it governs — see the constructors in
/// `scheduler.rs`, `governor.rs`, `retry.rs`, `worker.rs`, `queue.rs` for
/// where each one is consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    #[serde(default = "default_cron_schedule")]
    pub cron_schedule: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_max_concurrent_http")]
    pub max_concurrent_http: usize,

    #[serde(default = "default_max_concurrent_db")]
    pub max_concurrent_db: usize,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_shutdown_deadline_seconds")]
    pub shutdown_deadline_seconds: u64,

    #[serde(default = "default_job_max_retries")]
    pub job_max_retries: u32,

    #[serde(default = "default_job_retry_base_backoff_ms")]
    pub job_retry_base_backoff_ms: u64,

    #[serde(default = "default_job_retry_max_backoff_ms")]
    pub job_retry_max_backoff_ms: u64,

    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: i64,

    #[serde(default = "default_queue_max_depth")]
    pub queue_max_depth: usize,

    #[serde(default = "default_dead_letter_spill_path")]
    pub dead_letter_spill_path: String,

    /// Outbound buffer size for each C8 subscriber (§9.1: not one of the
    /// numbered options, added to give the "buffer is not full" contract a
    /// concrete capacity).
    #[serde(default = "default_subscriber_buffer_size")]
    pub subscriber_buffer_size: usize,

    #[serde(default)]
    pub store_connection_string: String,

    #[serde(default)]
    pub jwt_signing_key: Option<String>,

    #[serde(default)]
    pub endpoints: Vec<EndpointTarget>,

    #[serde(default)]
    pub connections: Vec<ConnectionTarget>,
}

fn default_timeout_seconds() -> u64 {
    10
}
fn default_cron_schedule() -> String {
    "0 */1 * * * *".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_max_concurrent_http() -> usize {
    10
}
fn default_max_concurrent_db() -> usize {
    10
}
fn default_heartbeat_interval_seconds() -> u64 {
    30
}
fn default_shutdown_deadline_seconds() -> u64 {
    30
}
fn default_job_max_retries() -> u32 {
    3
}
fn default_job_retry_base_backoff_ms() -> u64 {
    1_000
}
fn default_job_retry_max_backoff_ms() -> u64 {
    60_000
}
fn default_data_retention_days() -> i64 {
    30
}
fn default_queue_max_depth() -> usize {
    1_000
}
fn default_dead_letter_spill_path() -> String {
    "./pulsewatch-dead-letter.ndjson".to_string()
}
fn default_subscriber_buffer_size() -> usize {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            cron_schedule: default_cron_schedule(),
            timezone: default_timezone(),
            max_concurrent_http: default_max_concurrent_http(),
            max_concurrent_db: default_max_concurrent_db(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            shutdown_deadline_seconds: default_shutdown_deadline_seconds(),
            job_max_retries: default_job_max_retries(),
            job_retry_base_backoff_ms: default_job_retry_base_backoff_ms(),
            job_retry_max_backoff_ms: default_job_retry_max_backoff_ms(),
            data_retention_days: default_data_retention_days(),
            queue_max_depth: default_queue_max_depth(),
            dead_letter_spill_path: default_dead_letter_spill_path(),
            subscriber_buffer_size: default_subscriber_buffer_size(),
            store_connection_string: String::new(),
            jwt_signing_key: None,
            endpoints: Vec::new(),
            connections: Vec::new(),
        }
    }
}

/// Result of §4.11 validation: errors block the swap, warnings do not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        let report = config.validate();
        if !report.is_valid() {
            return Err(ConfigError::Validation(report.errors.join("; ")));
        }
        Ok(config)
    }

    /// Mirrors the teacher's `PULSEWATCH_CONFIG`-env-then-default-paths
    /// lookup order.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("PULSEWATCH_CONFIG") {
            return Self::load(path);
        }
        for path in ["./config/default.toml", "./config/production.toml", "/etc/pulsewatch/config.toml"] {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }
        Ok(Self::default())
    }

    /// §4.11's validation rules: the §3 invariants on each target/query, plus
    /// the cross-cutting rules named there explicitly.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.endpoints.iter().filter(|e| e.enabled).count() == 0 && self.connections.iter().filter(|c| c.enabled).count() == 0 {
            report.errors.push("at least one enabled endpoint or connection is required".to_string());
        }

        if crate::scheduler::validate_cron_expression(&self.cron_schedule, &self.timezone).is_err() {
            report.errors.push(format!("cron_schedule '{}' does not parse or has no next occurrence", self.cron_schedule));
        }

        if let Some(key) = &self.jwt_signing_key {
            if key.len() < 32 {
                report.errors.push("jwt_signing_key must be at least 32 characters".to_string());
            }
        }

        let mut seen_endpoints = HashSet::new();
        for e in &self.endpoints {
            if let Err(msg) = e.validate() {
                report.errors.push(format!("endpoint '{}': {msg}", e.name));
            }
            if !seen_endpoints.insert(e.name.clone()) {
                report.errors.push(format!("duplicate endpoint name: {}", e.name));
            }
        }

        let mut seen_connections = HashSet::new();
        for c in &self.connections {
            if let Err(msg) = c.validate() {
                report.errors.push(format!("connection '{}': {msg}", c.name));
            }
            if !seen_connections.insert(c.name.clone()) {
                report.errors.push(format!("duplicate connection name: {}", c.name));
            }
        }

        if self.max_concurrent_http == 0 || self.max_concurrent_db == 0 {
            report.warnings.push("a concurrency cap of 0 will stall all probes of that kind".to_string());
        }
        if self.data_retention_days <= 0 {
            report.warnings.push("data_retention_days <= 0 disables the janitor's retention sweep".to_string());
        }

        report
    }
}

/// Published config view: single-writer (the reloader), many-readers, via
/// atomic pointer swap (§5's "Config view" shared-resource policy).
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(config)) }
    }

    pub fn current(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Validates `next` and, only if valid, atomically publishes it.
    /// Readers mid-cycle keep their already-loaded snapshot (§5: "in-flight
    /// probes complete against the config snapshot they started with").
    pub fn reload(&self, next: Config) -> ValidationReport {
        let report = next.validate();
        if report.is_valid() {
            self.inner.store(Arc::new(next));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SqlProvider;

    fn endpoint(name: &str) -> EndpointTarget {
        EndpointTarget {
            name: name.to_string(),
            url: "https://example.com/health".to_string(),
            method: "GET".to_string(),
            timeout_seconds: Some(5),
            accepted_status_codes: vec![200],
            headers: Default::default(),
            environment: "test".into(),
            enabled: true,
            tags: vec![],
        }
    }

    #[test]
    fn default_config_is_valid() {
        let mut config = Config::default();
        config.endpoints.push(endpoint("svc"));
        assert!(config.validate().is_valid());
    }

    #[test]
    fn rejects_config_with_no_enabled_targets() {
        let report = Config::default().validate();
        assert!(!report.is_valid());
    }

    #[test]
    fn rejects_duplicate_endpoint_names() {
        let mut config = Config::default();
        config.endpoints.push(endpoint("svc"));
        config.endpoints.push(endpoint("svc"));
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("duplicate endpoint")));
    }

    #[test]
    fn rejects_short_jwt_signing_key() {
        let mut config = Config::default();
        config.endpoints.push(endpoint("svc"));
        config.jwt_signing_key = Some("too-short".to_string());
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn rejects_unparseable_cron_schedule() {
        let mut config = Config::default();
        config.endpoints.push(endpoint("svc"));
        config.cron_schedule = "not a cron expression".to_string();
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn reload_rejects_invalid_and_keeps_previous_snapshot() {
        let mut valid = Config::default();
        valid.endpoints.push(endpoint("svc"));
        let handle = ConfigHandle::new(valid.clone());

        let mut invalid = valid.clone();
        invalid.endpoints.clear();
        let report = handle.reload(invalid);

        assert!(!report.is_valid());
        assert_eq!(handle.current().endpoints.len(), 1);
    }

    #[test]
    fn duplicate_connection_names_rejected() {
        let mut config = Config::default();
        config.connections.push(ConnectionTarget {
            name: "db".into(),
            provider: SqlProvider::Postgres,
            connection_string: "postgres://x".into(),
            environment: "test".into(),
            connect_timeout_seconds: Some(5),
            command_timeout_seconds: Some(5),
            enabled: true,
            tags: vec![],
            queries: vec![],
            serialize: false,
        });
        config.connections.push(config.connections[0].clone());
        assert!(!config.validate().is_valid());
    }
}
