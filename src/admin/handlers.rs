use std::collections::BTreeSet;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{AccessLevel, AuthCredentials};
use crate::http::AppState;
use crate::observability::SecurityEvent;
use crate::resilience::{CircuitSnapshot, GovernorStatus, OperationMetrics};
use crate::security::{BlockedClient, ConnectionStats};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1_000;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub client_id: String,
    pub access_level: AccessLevel,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

#[derive(Serialize)]
pub struct OperationsView {
    #[serde(flatten)]
    pub status: GovernorStatus,
    pub recent: Vec<OperationMetrics>,
}

#[derive(Serialize)]
pub struct ConnectionsView {
    pub channel: ConnectionStats,
    pub blocked_clients: Vec<BlockedClient>,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub client_id: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    pub ttl_secs: Option<u64>,
    pub operations: Option<BTreeSet<String>>,
}

#[derive(Serialize)]
pub struct CreatedKey {
    pub key: String,
    pub client_id: String,
    pub access_level: AccessLevel,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeKeyRequest {
    pub key: String,
}

pub async fn get_status(
    State(state): State<AppState>,
    Extension(credentials): Extension<AuthCredentials>,
) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if state.shutdown.is_triggered() {
            "shutting_down"
        } else {
            "operational"
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        client_id: credentials.client_id,
        access_level: credentials.access_level,
    })
}

pub async fn get_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_circuits(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, CircuitSnapshot>> {
    Json(state.ctx.governor.status().circuits)
}

pub async fn reset_circuit(
    State(state): State<AppState>,
    Extension(credentials): Extension<AuthCredentials>,
    Path(op_type): Path<String>,
) -> Response {
    if state.ctx.governor.reset_circuit(&op_type) {
        tracing::info!(op_type = %op_type, client = %credentials.client_id, "Circuit reset via admin API");
        Json(json!({ "op_type": op_type, "state": "CLOSED" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no circuit for '{}'", op_type), "kind": "not_found" })),
        )
            .into_response()
    }
}

pub async fn get_operations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<OperationsView> {
    let governor = &state.ctx.governor;
    Json(OperationsView {
        status: governor.status(),
        recent: governor.recent_operations(params.limit()),
    })
}

pub async fn get_connections(State(state): State<AppState>) -> Json<ConnectionsView> {
    Json(ConnectionsView {
        channel: state.ctx.connections.stats(),
        blocked_clients: state.ctx.failures.blocked_clients(),
    })
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(credentials): Extension<AuthCredentials>,
    Json(request): Json<CreateKeyRequest>,
) -> Response {
    let client_id = request.client_id.trim();
    if client_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "client_id must not be empty", "kind": "invalid_request" })),
        )
            .into_response();
    }
    // A caller cannot mint a key stronger than its own credential.
    if request.access_level > credentials.access_level {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": format!("cannot grant {} as {}", request.access_level, credentials.access_level),
                "kind": "access_denied",
            })),
        )
            .into_response();
    }

    let key = state.ctx.auth.add_api_key(
        client_id,
        request.access_level,
        request.ttl_secs.map(Duration::from_secs),
        request.operations,
    );
    tracing::info!(client = %client_id, issued_by = %credentials.client_id, "API key issued");

    (
        StatusCode::CREATED,
        Json(CreatedKey {
            key,
            client_id: client_id.to_string(),
            access_level: request.access_level,
            ttl_secs: request.ttl_secs,
        }),
    )
        .into_response()
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Json(request): Json<RevokeKeyRequest>,
) -> Response {
    if state.ctx.auth.revoke_api_key(&request.key) {
        Json(json!({ "revoked": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "revoked": false, "kind": "not_found" })),
        )
            .into_response()
    }
}

/// Most recent security events, newest first.
pub async fn get_audit(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<SecurityEvent>> {
    let mut events = state.ctx.audit.recent();
    events.reverse();
    events.truncate(params.limit());
    Json(events)
}
