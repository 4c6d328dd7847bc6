//! Health probe router.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api::{HealthState, health_check};

/// Router serving the health probe on `/`, `/health` and `/ready`.
pub fn create_health_router() -> Router<Arc<HealthState>> {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/ready", get(health_check))
        .layer(TraceLayer::new_for_http())
}
