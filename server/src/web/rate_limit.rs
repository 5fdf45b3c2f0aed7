use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::engine::rate_limiter::RateLimiter;

/// Per-IP rate limiters for the two endpoint tiers.
pub struct ApiRateLimiters {
    /// Room listing: burst of 30, refill 1 per second.
    pub api: RateLimiter,
    /// WebSocket connections: prevent connection storms.
    /// Burst of 5, refill 1 per 12 seconds (~5/minute).
    pub ws: RateLimiter,
    /// Whether forwarding headers from loopback peers are believed.
    pub trust_proxy: bool,
}

impl ApiRateLimiters {
    pub fn new(trust_proxy: bool) -> Self {
        Self {
            api: RateLimiter::new(30, 1.0),
            ws: RateLimiter::new(5, 12.0),
            trust_proxy,
        }
    }

    /// Forget addresses that have been quiet for `older_than`.
    pub fn cleanup(&self, older_than: Duration) {
        self.api.cleanup(older_than);
        self.ws.cleanup(older_than);
    }
}

/// Client address of a request, only trusting proxy headers from loopback.
///
/// When the direct peer is a loopback address the connection is coming
/// through a local reverse proxy and X-Forwarded-For / X-Real-IP are used.
/// Otherwise the peer address wins so the headers cannot be spoofed.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    let peer_ip = peer.map(|p| p.ip());
    let from_loopback = peer_ip.is_some_and(|ip| ip.is_loopback());

    if trust_proxy && from_loopback {
        if let Some(forwarded) = headers.get("x-forwarded-for")
            && let Ok(val) = forwarded.to_str()
            && let Some(first) = val.split(',').next()
            && !first.trim().is_empty()
        {
            return first.trim().to_string();
        }

        if let Some(real_ip) = headers.get("x-real-ip")
            && let Ok(val) = real_ip.to_str()
        {
            return val.trim().to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn request_ip(req: &Request<Body>, trust_proxy: bool) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    client_ip(req.headers(), peer, trust_proxy)
}

/// Middleware for the public API.
pub async fn api_rate_limit(req: Request<Body>, next: Next) -> Response {
    let limiters = req.extensions().get::<Arc<ApiRateLimiters>>();
    if let Some(limiters) = limiters {
        let ip = request_ip(&req, limiters.trust_proxy);
        if !limiters.api.check(&ip) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response();
        }
    }
    next.run(req).await
}

/// Middleware for WebSocket connection rate limiting.
pub async fn ws_rate_limit(req: Request<Body>, next: Next) -> Response {
    let limiters = req.extensions().get::<Arc<ApiRateLimiters>>();
    if let Some(limiters) = limiters {
        let ip = request_ip(&req, limiters.trust_proxy);
        if !limiters.ws.check(&ip) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections. Please try again later.",
            )
                .into_response();
        }
    }
    next.run(req).await
}
