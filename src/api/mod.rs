//! Diagnostics HTTP surface: read-only state views plus a small set of
//! admin endpoints, served over axum with a tower-http trace layer.

pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .merge(routes::router())
        .with_state(orchestrator)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
