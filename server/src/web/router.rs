use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

use super::app_state::AppState;
use super::rate_limit::{ApiRateLimiters, api_rate_limit, ws_rate_limit};
use super::{rest_api, ws_handler};

/// Build the axum router with all HTTP and WebSocket routes. The limiters
/// are owned by the caller so stale addresses can be swept.
pub fn build_router(state: Arc<AppState>, rate_limiters: Arc<ApiRateLimiters>) -> Router {
    // Restrict CORS to the configured public_url origin, or allow any when unset
    let public_url = &state.public_url;
    let cors = if public_url.is_empty()
        || public_url.contains("localhost")
        || public_url.contains("127.0.0.1")
    {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origin = public_url
            .parse::<HeaderValue>()
            .unwrap_or_else(|_| HeaderValue::from_static("https://localhost"));
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // WebSocket connections are rate limited separately
    let ws_routes = Router::new()
        .route(
            "/socket/{channel}",
            axum::routing::get(ws_handler::ws_upgrade),
        )
        .layer(axum::middleware::from_fn(ws_rate_limit));

    let api_routes = Router::new()
        .route("/api/channels", axum::routing::get(rest_api::get_channels))
        .layer(axum::middleware::from_fn(api_rate_limit));

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .layer(cors)
        // Inject rate limiters into all request extensions
        .layer(axum::Extension(rate_limiters))
        .with_state(state)
}
