use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub peers: usize,
}

pub async fn health_check(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        peers: state.peer_count(),
    })
}
