use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use pulsewatch_core::{Error, Result, Worker};

use crate::routes;
use crate::state::AppState;

/// Binds and serves the REST/SSE surface described in §6's "Exposed"
/// operations. The caller owns the worker's own lifecycle (`Worker::run`);
/// this only stops accepting connections when `shutdown` resolves.
pub async fn run(worker: Arc<Worker>, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
    let app_state = AppState::new(worker);
    let app = build_router(app_state);

    info!("pulsewatch API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| Error::Validation(format!("invalid bind address: {e}")))?;

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.map_err(|e| Error::Validation(e.to_string()))?;

    Ok(())
}

fn build_router(state: AppState) -> axum::Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    routes::router().with_state(state).layer(TraceLayer::new_for_http()).layer(cors)
}
