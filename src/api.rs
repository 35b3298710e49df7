//! Plain HTTP endpoints alongside the WebSocket route.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::AppState;

/// Hub status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Connections currently receiving broadcasts
    pub connections: usize,
    /// Connection read loops still running
    pub readers: usize,
    pub queue_capacity: usize,
}

/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connections: state.registry.len().await,
        readers: state.active_readers(),
        queue_capacity: state.config.queue_capacity,
    })
}
