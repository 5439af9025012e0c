mod health;
mod metrics;
mod predict;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health_check", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/predict", post(predict::predict))
}
