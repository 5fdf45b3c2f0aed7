use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Serialize;

use super::app_state::AppState;
use crate::engine::channel::ChannelSummary;

#[derive(Serialize)]
pub struct ChannelListing {
    pub channels: Vec<ChannelSummary>,
    /// Rooms loaded in memory, listed or not.
    pub loaded: usize,
}

/// GET /api/channels: public rooms, busiest first.
pub async fn get_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ChannelListing {
        channels: state.registry.public_listing(),
        loaded: state.registry.len(),
    })
}
