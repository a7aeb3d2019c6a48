use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use pulsewatch_core::{ResultFilter, ResultStatus, Subscriber};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", axum::routing::get(root))
        .route("/health", axum::routing::get(health))
        .route("/v1/probes/trigger", axum::routing::post(trigger_all))
        .route("/v1/probes/trigger/:name", axum::routing::post(trigger_target))
        .route("/v1/jobs/:id/cancel", axum::routing::post(cancel_job))
        .route("/v1/jobs/:id/retry", axum::routing::post(retry_job))
        .route("/v1/metrics", axum::routing::get(metrics_snapshot))
        .route("/v1/results", axum::routing::get(list_results))
        .route("/v1/events", axum::routing::get(subscribe_events))
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "name": "pulsewatch", "version": pulsewatch_core::VERSION }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.worker.status().await;
    Json(serde_json::json!({ "status": format!("{status:?}") }))
}

async fn trigger_all(State(state): State<AppState>) -> Result<Json<Vec<Uuid>>, ApiError> {
    let ids = state.worker.trigger_all().await?;
    Ok(Json(ids))
}

async fn trigger_target(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Vec<Uuid>>, ApiError> {
    let ids = state.worker.trigger_target(&name).await?;
    Ok(Json(ids))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = state.worker.cancel_job(id).await?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

async fn retry_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>, ApiError> {
    state.worker.retry_job(id).await?;
    Ok(Json(serde_json::json!({ "retried": true })))
}

async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.worker.metrics_snapshot())
}

/// Query parameters for `/v1/results`, mirroring `ResultFilter` field for
/// field; `page_size` is clamped to <= 200 downstream in the store.
#[derive(Debug, Deserialize, Default)]
struct ListResultsQuery {
    target: Option<String>,
    query: Option<String>,
    status: Option<ResultStatus>,
    environment: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    50
}

async fn list_results(State(state): State<AppState>, Query(q): Query<ListResultsQuery>) -> Result<impl IntoResponse, ApiError> {
    let filter = ResultFilter {
        target_name: q.target,
        query_name: q.query,
        status: q.status,
        environment: q.environment,
        since: q.since,
        until: q.until,
        page: q.page,
        page_size: q.page_size,
    };
    let results = state.worker.list_results(filter).await?;
    Ok(Json(results))
}

/// Identifies the caller for `subscribe` (§6). There is no bearer-token
/// validation layer in this service (`jwt_signing_key` gates the config
/// surface, not this one) — the caller's principal, groups and permissions
/// are taken directly from these headers, which a front proxy is expected to
/// set after its own authentication.
#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    #[serde(default = "default_principal")]
    principal: String,
    #[serde(default)]
    groups: String,
    #[serde(default = "default_permissions")]
    permissions: String,
}

fn default_principal() -> String {
    "anonymous".to_string()
}
fn default_permissions() -> String {
    "view_monitoring".to_string()
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect()
}

async fn subscribe_events(
    State(state): State<AppState>,
    Query(q): Query<SubscribeQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscriber = Subscriber {
        id: Uuid::new_v4(),
        principal: q.principal,
        roles: vec![],
        permissions: split_csv(&q.permissions),
        groups: split_csv(&q.groups),
    };

    let handle = state.worker.subscribe(subscriber).await;
    let stream = ReceiverStream::new(handle.receiver).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.group().to_string()).data(payload))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use pulsewatch_core::{Clock, Config, ConfigHandle, EndpointTarget, ResultRecord, SqlStore, Store, SystemClock, Worker};

    use super::*;
    use crate::state::AppState;

    async fn test_app() -> axum::Router {
        let mut config = Config::default();
        config.cron_schedule = "0 0 0 1 1 *".to_string(); // fires once a year, out of the way of tests
        config.endpoints.push(EndpointTarget {
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

        let store: Arc<dyn Store> = Arc::new(SqlStore::connect("sqlite::memory:").await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let worker = Worker::new("test-worker", "localhost", "test", ConfigHandle::new(config), clock, store);

        router().with_state(AppState::new(worker))
    }

    #[tokio::test]
    async fn trigger_all_enqueues_one_job_per_enabled_endpoint() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().method("POST").uri("/v1/probes/trigger").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let ids: Vec<Uuid> = serde_json::from_slice(&body).unwrap();
        assert_eq!(ids.len(), 1, "exactly one enabled endpoint should yield exactly one job id");
    }

    #[tokio::test]
    async fn trigger_unknown_target_returns_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/probes/trigger/does-not-exist").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_not_found() {
        let app = test_app().await;
        let id = Uuid::new_v4();
        let response =
            app.oneshot(Request::builder().method("POST").uri(format!("/v1/jobs/{id}/cancel")).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_snapshot_is_reachable() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().uri("/v1/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(snapshot.get("uptime_seconds").is_some(), "snapshot should report uptime: {snapshot}");
        assert!(snapshot.get("probes_started_total").is_some(), "snapshot should report started-probe counters: {snapshot}");
    }

    #[tokio::test]
    async fn list_results_defaults_to_empty_page() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().uri("/v1/results").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let results: Vec<ResultRecord> = serde_json::from_slice(&body).unwrap();
        assert!(results.is_empty(), "a worker that never ran should have no results yet");
    }
}
