use std::sync::Arc;

use crate::engine::registry::RoomRegistry;

/// Shared state handed to every HTTP and WebSocket handler.
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    /// Honour forwarding headers from loopback peers.
    pub trust_proxy: bool,
    /// Allowed CORS origin; empty allows any.
    pub public_url: String,
}
