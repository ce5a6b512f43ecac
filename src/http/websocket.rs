//! Local streaming channel.
//!
//! # Responsibilities
//! - Authorize and admit a connection before completing the upgrade
//! - Meter every inbound frame through the connection governor
//! - Close with a policy frame on any violation, eviction or shutdown
//!
//! # Data Flow
//! ```text
//! GET /channel
//!     → failure limiter (blocked caller?) → authenticator ("channel_connect")
//!     → ConnectionGovernor::register_connection → upgrade
//!     → per frame: validate_message → ack
//!     → on exit: unregister_connection
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use crate::auth::AuthErrorKind;
use crate::error::GuardError;
use crate::http::request::ClientIp;
use crate::http::AppState;
use crate::security::ResourceErrorKind;

/// WebSocket close reasons are capped at 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

pub async fn channel_handler(
    State(state): State<AppState>,
    client_ip: ClientIp,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = &state.ctx;
    let limiter_key = client_ip.limiter_key();

    if let Err(blocked) = ctx.failures.check(&limiter_key) {
        return GuardError::from(blocked).into_response();
    }

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credentials = match ctx
        .auth
        .authenticate_request(auth_header, client_ip.0, "channel_connect")
    {
        Ok(credentials) => credentials,
        Err(error) => {
            if error.kind() != AuthErrorKind::AccessDenied {
                ctx.failures.record_failure(&limiter_key, "authentication");
            }
            return GuardError::from(error).into_response();
        }
    };

    let ip = client_ip.0.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let connection_id = format!("{}-{}", credentials.client_id, Uuid::new_v4());
    if let Err(error) = ctx.connections.register_connection(&connection_id, ip) {
        let retry_after = match &error {
            crate::security::ResourceError::IpBanned { retry_after, .. } => Some(*retry_after),
            _ => None,
        };
        let global_cap = error.kind() == ResourceErrorKind::ConnectionLimit;
        let mut response = GuardError::from(error).into_response();
        if global_cap {
            *response.status_mut() = axum::http::StatusCode::SERVICE_UNAVAILABLE;
        }
        if let Some(value) = retry_after
            .and_then(|d| HeaderValue::from_str(&d.as_secs().max(1).to_string()).ok())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    let max_frame = ctx.connections.config().max_message_size.saturating_mul(2);
    let failed_state = state.clone();
    let failed_id = connection_id.clone();
    ws.max_message_size(max_frame)
        .on_failed_upgrade(move |error| {
            tracing::warn!(client = %failed_id, error = %error, "Channel upgrade failed");
            failed_state.ctx.connections.unregister_connection(&failed_id);
        })
        .on_upgrade(move |socket| run_channel(state, socket, connection_id))
}

async fn run_channel(state: AppState, mut socket: WebSocket, client_id: String) {
    let connections = state.ctx.connections.clone();
    let mut shutdown = state.shutdown.subscribe();
    let check_every = Duration::from_secs(connections.config().cleanup_interval_secs.max(1));
    let mut liveness = time::interval_at(time::Instant::now() + check_every, check_every);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(client = %client_id, "Channel connection opened");
    let welcome = json!({
        "type": "welcome",
        "client_id": client_id,
        "max_message_size": connections.config().max_message_size,
    })
    .to_string();
    let mut close = None;
    if send_text(&mut socket, &state, &client_id, welcome).await {
        let mut seq: u64 = 0;
        close = loop {
            tokio::select! {
                frame = socket.recv() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!(client = %client_id, error = %e, "Channel read failed");
                            break None;
                        }
                        None => break None,
                    };
                    let size = match &message {
                        Message::Text(text) => text.len(),
                        Message::Binary(bytes) => bytes.len(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => break None,
                    };
                    if let Err(error) = connections.validate_message(&client_id, size) {
                        break Some((close_code::POLICY, error.to_string()));
                    }
                    seq += 1;
                    let ack = json!({ "type": "ack", "seq": seq, "bytes": size }).to_string();
                    if !send_text(&mut socket, &state, &client_id, ack).await {
                        break None;
                    }
                }
                _ = liveness.tick() => {
                    if !connections.is_registered(&client_id) {
                        break Some((close_code::POLICY, "connection evicted".to_string()));
                    }
                }
                _ = shutdown.recv() => {
                    break Some((close_code::AWAY, "server shutting down".to_string()));
                }
            }
        };
    }

    if let Some((code, reason)) = close {
        tracing::info!(client = %client_id, code, reason = %reason, "Closing channel connection");
        let frame = CloseFrame {
            code,
            reason: close_reason(&reason).into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    }

    if let Some(metrics) = connections.unregister_connection(&client_id) {
        tracing::info!(
            client = %client_id,
            messages = metrics.message_count,
            bytes_received = metrics.bytes_received,
            "Channel connection closed"
        );
    }
}

async fn send_text(socket: &mut WebSocket, state: &AppState, client_id: &str, text: String) -> bool {
    let bytes = text.len();
    match socket.send(Message::Text(text.into())).await {
        Ok(()) => {
            state.ctx.connections.record_sent(client_id, bytes);
            true
        }
        Err(e) => {
            tracing::debug!(client = %client_id, error = %e, "Channel write failed");
            false
        }
    }
}

fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_fit_the_frame() {
        assert_eq!(close_reason("too large"), "too large");
        let long = "é".repeat(100);
        let cut = close_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(&cut));
    }
}
