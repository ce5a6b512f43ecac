//! Request-side helpers shared by the management API and the channel.
//!
//! # Responsibilities
//! - Name the request ID header stamped by the server layers
//! - Extract the caller's IP from connection info when it is present
//!
//! # Design Decisions
//! - A missing peer address is not an error; it just never counts as loopback

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

/// Header carrying the per-request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Caller IP, when the server was started with connect info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

impl ClientIp {
    pub fn from_parts(parts: &Parts) -> Self {
        Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
        )
    }

    /// Key used for failure accounting before the caller is identified.
    pub fn limiter_key(&self) -> String {
        match self.0 {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        }
    }
}

/// Request ID set by the server layers, or `"unknown"`.
pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};

    #[tokio::test]
    async fn client_ip_reads_connect_info() {
        let request = Request::builder()
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))))
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ip, Some(IpAddr::from([10, 0, 0, 7])));
        assert_eq!(ClientIp(ip).limiter_key(), "ip:10.0.0.7");
    }

    #[tokio::test]
    async fn missing_connect_info_is_none() {
        let (mut parts, _) = Request::new(()).into_parts();
        let ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ip, ClientIp(None));
        assert_eq!(ip.limiter_key(), "ip:unknown");
    }

    #[test]
    fn request_id_falls_back() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id(&headers), "unknown");
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        assert_eq!(request_id(&headers), "abc");
    }
}
