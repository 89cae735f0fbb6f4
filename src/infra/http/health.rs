//! Liveness endpoint served next to a standalone worker.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::application::jobs::{WorkerHealth, WorkerHealthSnapshot};

pub fn build_health_router(health: Arc<WorkerHealth>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(health)
}

async fn healthz(State(health): State<Arc<WorkerHealth>>) -> Json<WorkerHealthSnapshot> {
    Json(health.snapshot())
}
