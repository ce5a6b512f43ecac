//! Authentication middleware for the management API.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::AuthErrorKind;
use crate::error::GuardError;
use crate::http::request::{request_id, ClientIp};
use crate::http::AppState;

/// Operation name a request performs, as listed in the access table.
pub fn operation_for(method: &Method, path: &str) -> &'static str {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["admin", "status"]) => "status",
        (&Method::GET, ["admin", "health"]) => "health",
        (&Method::GET, ["admin", "circuits"]) => "view_circuits",
        (&Method::POST, ["admin", "circuits", _, "reset"]) => "reset_circuit",
        (&Method::GET, ["admin", "operations"]) => "view_operations",
        (&Method::GET, ["admin", "connections"]) => "view_connections",
        (&Method::POST | &Method::DELETE, ["admin", "keys"]) => "manage_api_keys",
        (&Method::GET, ["admin", "audit"]) => "view_audit",
        _ => "unknown",
    }
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let client_ip = ClientIp::from_parts(&parts);
    let limiter_key = client_ip.limiter_key();
    let operation = operation_for(&parts.method, parts.uri.path());
    let ctx = &state.ctx;

    if let Err(blocked) = ctx.failures.check(&limiter_key) {
        let retry_after = blocked.retry_after.as_secs().max(1);
        tracing::warn!(
            request_id = %request_id(&parts.headers),
            client = %limiter_key,
            operation,
            "Blocked client refused"
        );
        let mut response = GuardError::from(blocked).into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    let auth_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match ctx
        .auth
        .authenticate_request(auth_header, client_ip.0, operation)
    {
        Ok(credentials) => {
            tracing::debug!(
                request_id = %request_id(&parts.headers),
                client = %credentials.client_id,
                level = %credentials.access_level,
                operation,
                "Admin request authorized"
            );
            parts.extensions.insert(credentials);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(error) => {
            let kind = error.kind();
            if matches!(kind, AuthErrorKind::Authentication | AuthErrorKind::Expired) {
                ctx.failures.record_failure(&limiter_key, "authentication");
            }

            let mut response = GuardError::from(error).into_response();
            // Anonymous callers are asked to authenticate rather than told no.
            if auth_header.is_none() && kind == AuthErrorKind::AccessDenied {
                *response.status_mut() = StatusCode::UNAUTHORIZED;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer, ApiKey, HMAC-SHA256"),
                );
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_are_resolved_from_method_and_path() {
        assert_eq!(operation_for(&Method::GET, "/admin/status"), "status");
        assert_eq!(operation_for(&Method::GET, "/admin/circuits/"), "view_circuits");
        assert_eq!(
            operation_for(&Method::POST, "/admin/circuits/lint/reset"),
            "reset_circuit"
        );
        assert_eq!(operation_for(&Method::DELETE, "/admin/keys"), "manage_api_keys");
        assert_eq!(operation_for(&Method::GET, "/admin/audit"), "view_audit");
        assert_eq!(operation_for(&Method::GET, "/admin/circuits/lint/reset"), "unknown");
        assert_eq!(operation_for(&Method::PUT, "/admin/status"), "unknown");
    }
}
