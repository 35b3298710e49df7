use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{api, state::AppState, ws};

/// Cross-origin policy for the plain HTTP surface: everything is allowed
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/api/status", get(api::status))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
