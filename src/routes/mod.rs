//! HTTP surface
//!
//! Route table:
//! - `GET /documents/<path...>` render or metadata (CORS-enabled)
//! - `OPTIONS /documents/<path...>` CORS preflight
//! - `GET /health`
//! - `GET /filecache/list`
//! - `POST /rastercache/purge`
//! - `POST /shutdown`

mod admin;
mod documents;
mod gzip;
pub mod middleware;

use std::time::Duration;

use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::state::AppState;

/// Whole-response deadline, the moral equivalent of a server write timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
    let documents = Router::new()
        .route(
            "/documents/*path",
            get(documents::handle_document).options(preflight),
        )
        .layer(from_fn(middleware::cors));

    Router::new()
        .route("/health", get(admin::health))
        .route("/favicon.ico", get(admin::favicon))
        .route("/filecache/list", get(admin::filecache_list))
        .route("/rastercache/purge", post(admin::rastercache_purge))
        .route("/shutdown", post(admin::shutdown))
        .merge(documents)
        .layer(from_fn(middleware::log_requests))
        .layer(from_fn(middleware::request_id))
        .layer(from_fn(middleware::limit_body))
        .layer(TimeoutLayer::new(RESPONSE_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The explicit preflight handler exists so OPTIONS matches a route; the
/// CORS middleware answers before it ever runs.
async fn preflight() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}
