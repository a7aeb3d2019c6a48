use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::Notify;

use crate::classifier::RawOutcome;
use crate::error::ProbeError;
use crate::models::EndpointTarget;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_FAILURE_WINDOW: Duration = Duration::from_secs(30);
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-target transport circuit breaker (§7). This is deliberately separate
/// from the job-level `RetryPolicy` in `retry.rs` — §9 calls these out as
/// two layers that must not be collapsed into one.
struct CircuitBreaker {
    state: std::sync::Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    window_start_ms: AtomicU64,
    opened_at_ms: AtomicU64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    /// Returns true if a probe is allowed to proceed right now.
    fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Relaxed);
                if Self::now_ms().saturating_sub(opened_at) >= CIRCUIT_OPEN_DURATION.as_millis() as u64 {
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => false, // a half-open probe is already in flight
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let now = Self::now_ms();
        let window_start = self.window_start_ms.load(Ordering::Relaxed);
        if now.saturating_sub(window_start) > CIRCUIT_FAILURE_WINDOW.as_millis() as u64 {
            self.window_start_ms.store(now, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        let mut state = self.state.lock().unwrap();
        if *state == CircuitState::HalfOpen || failures >= CIRCUIT_FAILURE_THRESHOLD {
            *state = CircuitState::Open;
            self.opened_at_ms.store(now, Ordering::Relaxed);
        }
    }
}

/// C4: executes one HTTP check against one `EndpointTarget`. A single call
/// never retries internally — the outer `RetryPolicy` decides whether and
/// when to call again.
pub struct HttpProbeExecutor {
    client: Client,
    default_timeout: Duration,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl HttpProbeExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .user_agent(concat!("pulsewatch/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            default_timeout,
            breakers: DashMap::new(),
        }
    }

    fn breaker_for(&self, target_name: &str) -> Arc<CircuitBreaker> {
        self.breakers.entry(target_name.to_string()).or_insert_with(|| Arc::new(CircuitBreaker::new())).clone()
    }

    pub async fn execute(&self, target: &EndpointTarget, shutdown: &Notify) -> RawOutcome {
        let breaker = self.breaker_for(&target.name);
        if !breaker.allow() {
            return RawOutcome::Error(ProbeError::Transport("circuit breaker open".to_string()));
        }

        let timeout = target
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let method = reqwest::Method::from_bytes(target.method.as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut request = self.client.request(method, &target.url);
        for (key, value) in &target.headers {
            request = request.header(key, value);
        }

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, request.send()) => {
                match result {
                    Err(_) => RawOutcome::Error(ProbeError::Timeout(timeout.as_millis() as u64)),
                    Ok(Err(e)) => RawOutcome::Error(ProbeError::Transport(e.to_string())),
                    Ok(Ok(response)) => RawOutcome::Http {
                        status_code: response.status().as_u16(),
                        reason_phrase: response
                            .status()
                            .canonical_reason()
                            .unwrap_or("")
                            .to_string(),
                    },
                }
            }
            _ = shutdown.notified() => RawOutcome::Error(ProbeError::Cancelled),
        };

        match &outcome {
            RawOutcome::Error(ProbeError::Transport(_)) => breaker.record_failure(),
            RawOutcome::Error(ProbeError::Cancelled) => {}
            RawOutcome::Error(_) => {}
            _ => breaker.record_success(),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(url: String) -> EndpointTarget {
        EndpointTarget {
            name: "svc".into(),
            url,
            method: "GET".into(),
            timeout_seconds: Some(2),
            accepted_status_codes: vec![200],
            headers: HashMap::new(),
            environment: "test".into(),
            enabled: true,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn successful_request_yields_http_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/ok")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let executor = HttpProbeExecutor::new(Duration::from_secs(5));
        let shutdown = Notify::new();
        let outcome = executor.execute(&target(format!("{}/ok", server.uri())), &shutdown).await;
        match outcome {
            RawOutcome::Http { status_code, .. } => assert_eq!(status_code, 200),
            other => panic!("expected Http outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_reported_as_http_outcome_not_probe_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/down")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let executor = HttpProbeExecutor::new(Duration::from_secs(5));
        let shutdown = Notify::new();
        let outcome = executor.execute(&target(format!("{}/down", server.uri())), &shutdown).await;
        match outcome {
            RawOutcome::Http { status_code, .. } => assert_eq!(status_code, 503),
            other => panic!("expected Http outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn circuit_opens_after_five_consecutive_transport_failures() {
        let executor = HttpProbeExecutor::new(Duration::from_millis(50));
        let shutdown = Notify::new();
        let t = target("http://127.0.0.1:1".to_string()); // nothing listening: connection refused

        for _ in 0..5 {
            executor.execute(&t, &shutdown).await;
        }

        let outcome = executor.execute(&t, &shutdown).await;
        match outcome {
            RawOutcome::Error(ProbeError::Transport(msg)) => assert!(msg.contains("circuit breaker")),
            other => panic!("expected circuit breaker to reject, got {other:?}"),
        }
    }
}
