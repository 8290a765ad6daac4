//! Client IP resolution for IP-bound access descriptors.
//!
//! `X-Forwarded-For` is only honoured for the number of proxies configured in
//! `TRUSTED_PROXY_COUNT`; without trusted proxies the header is ignored, since any client
//! could forge it.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::AppState;

/// Address of the requesting client, when it can be determined.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let socket = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(resolve(
            &parts.headers,
            socket,
            state.config.trusted_proxy_count,
        )))
    }
}

/// Each trusted proxy appends the address it received the request from, so the client is
/// the `trusted_proxies`-th entry from the right.
pub fn resolve(
    headers: &HeaderMap,
    socket: Option<SocketAddr>,
    trusted_proxies: usize,
) -> Option<IpAddr> {
    if trusted_proxies > 0 {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if forwarded.len() >= trusted_proxies {
            if let Ok(ip) = forwarded[forwarded.len() - trusted_proxies].parse() {
                return Some(ip);
            }
        }
    }
    socket.map(|addr| addr.ip())
}
