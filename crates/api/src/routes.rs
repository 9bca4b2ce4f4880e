use axum::{
    routing::{get, post},
    Router,
};
use montecarlo_aggregator::Aggregator;
use std::sync::Arc;

use crate::handlers::{
    events::event_stream,
    health::health_check,
    metrics::{get_metrics, reset_metrics},
};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/metrics", get(get_metrics))
        .route("/api/metrics/reset", post(reset_metrics))
        .route("/api/events", get(event_stream))
        .with_state(state)
}
