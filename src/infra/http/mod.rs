pub mod error;
pub mod handlers;
mod health;
pub mod middleware;
pub mod models;

pub use health::build_health_router;
pub use middleware::ApiKey;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::{
    artifacts::ArtifactStore,
    jobs::{RenderJobService, TemplateResolver},
    render::RenderExecutor,
};

/// Request bodies carry inline templates with `data:` images.
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct HttpState {
    pub jobs: RenderJobService,
    pub executor: RenderExecutor,
    pub templates: Arc<TemplateResolver>,
    pub artifacts: Arc<ArtifactStore>,
    pub api_key: Option<ApiKey>,
}

pub fn build_router(state: HttpState) -> Router {
    let protected = Router::new()
        .route("/render/from-data", post(handlers::render_from_data))
        .route("/enqueue", post(handlers::enqueue))
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs/{id}/retry", post(handlers::retry_job))
        .route("/jobs/{id}/remove", post(handlers::remove_job))
        .route("/out/{id}", get(handlers::artifact))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/render", post(handlers::render))
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
