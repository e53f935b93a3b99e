use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::USER_AGENT, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::rate_limiter::client_ip;
use crate::services::audit::Actor;
use crate::AppState;

/// Caller address: proxy headers first, then the socket peer.
pub fn caller_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    client_ip(headers).or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.chars().take(256).collect())
}

/// Audit actor for a request made with the internal credential.
pub fn admin_actor(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> Actor {
    Actor::admin_api(caller_ip(headers, connect), user_agent(headers))
}

/// Rejects browser-originated calls and calls without a valid internal key.
pub async fn require_internal_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(err) = state.credentials.authorize(request.headers()) {
        return err.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn proxy_header_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer = ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert_eq!(caller_ip(&headers, Some(&peer)).as_deref(), Some("203.0.113.9"));
        assert_eq!(
            caller_ip(&HeaderMap::new(), Some(&peer)).as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(caller_ip(&HeaderMap::new(), None), None);
    }
}
