//! HTTP endpoints for crane-relay.
//!
//! Served on a separate listener from the WebSocket relay.

pub mod health;
mod metrics;

use crate::server::CraneRelay;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<CraneRelay>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(relay))
}
