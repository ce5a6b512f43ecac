//! Management API.
//!
//! Every route is gated by [`auth::admin_auth_middleware`], which resolves
//! the operation a request performs and authorizes it against the
//! operation's minimum access level.

pub mod auth;
pub mod handlers;

use axum::routing::{get, post};
use axum::{middleware, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/health", get(get_health))
        .route("/admin/circuits", get(get_circuits))
        .route("/admin/circuits/{op_type}/reset", post(reset_circuit))
        .route("/admin/operations", get(get_operations))
        .route("/admin/connections", get(get_connections))
        .route("/admin/keys", post(create_api_key).delete(revoke_api_key))
        .route("/admin/audit", get(get_audit))
        .layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
