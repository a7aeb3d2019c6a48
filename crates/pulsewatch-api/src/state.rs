use std::sync::Arc;

use pulsewatch_core::Worker;

/// Shared state handed to every axum handler. Thin on purpose: every
/// operation it exposes is a direct forward onto the worker, which owns all
/// of the actual concurrency, classification and persistence logic.
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<Worker>,
}

impl AppState {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}
