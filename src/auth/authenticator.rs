//! Multi-method request authentication.
//!
//! # Resolution Order
//! ```text
//! loopback peer + local_only  → Local / Admin
//! no Authorization header     → Anonymous / default level
//! Bearer <token>              → signed token
//! ApiKey <key> | <bare key>   → API key registry
//! HMAC-SHA256 c:ts:sig        → request signature / Internal
//! ```
//! Every resolved credential then passes the same authorization check:
//! expiry, operation allow-list, operation minimum level.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use serde_json::json;

use super::access::{required_level, AccessLevel};
use super::api_keys::{ApiKeyRecord, ApiKeyRegistry};
use super::credentials::{unix_now, AuthCredentials, AuthMethod};
use super::token::{self, TokenClaims};
use crate::config::AuthConfig;
use crate::observability::audit::{preview, AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

/// Environment variable consulted when the config carries no secret.
pub const SECRET_ENV: &str = "TOOLGUARD_AUTH_SECRET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    Authentication,
    Expired,
    AccessDenied,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Expired => "expired",
            Self::AccessDenied => "access_denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("credentials for '{client_id}' have expired")]
    Expired { client_id: String },

    #[error("'{client_id}' ({level}) may not perform '{operation}'")]
    AccessDenied {
        client_id: String,
        level: AccessLevel,
        operation: String,
    },
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::Authentication { .. } => AuthErrorKind::Authentication,
            Self::Expired { .. } => AuthErrorKind::Expired,
            Self::AccessDenied { .. } => AuthErrorKind::AccessDenied,
        }
    }

    fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }
}

pub struct Authenticator {
    config: AuthConfig,
    secret: Vec<u8>,
    api_keys: Mutex<ApiKeyRegistry>,
    audit: AuditSink,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("local_only", &self.config.local_only)
            .field("default_access_level", &self.config.default_access_level)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Build from config. The secret comes from the config, then
    /// `TOOLGUARD_AUTH_SECRET`, then a random per-process value.
    pub fn new(config: AuthConfig, audit: AuditSink) -> Self {
        let secret = resolve_secret(&config);
        Self::with_secret(config, secret, audit)
    }

    pub fn with_secret(config: AuthConfig, secret: impl Into<Vec<u8>>, audit: AuditSink) -> Self {
        Self {
            config,
            secret: secret.into(),
            api_keys: Mutex::new(ApiKeyRegistry::new()),
            audit,
        }
    }

    /// Resolve and authorize the caller of `operation`.
    pub fn authenticate_request(
        &self,
        auth_header: Option<&str>,
        client_ip: Option<IpAddr>,
        operation: &str,
    ) -> Result<AuthCredentials, AuthError> {
        let resolved = self.identify(auth_header, client_ip, operation);
        let method = resolved.as_ref().map(|c| c.method.as_str()).unwrap_or("unknown");
        let result = resolved.and_then(|creds| self.authorize(creds, operation));

        self.report(&result, auth_header, client_ip, operation);
        metrics::record_auth(
            method,
            match &result {
                Ok(_) => "success",
                Err(e) => e.kind().as_str(),
            },
        );
        result
    }

    fn identify(
        &self,
        auth_header: Option<&str>,
        client_ip: Option<IpAddr>,
        operation: &str,
    ) -> Result<AuthCredentials, AuthError> {
        let loopback = client_ip.is_some_and(|ip| ip.to_canonical().is_loopback());
        if self.config.local_only && loopback {
            return Ok(AuthCredentials::new("local", AccessLevel::Admin, AuthMethod::Local));
        }

        let Some(header) = auth_header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(AuthCredentials::new(
                "anonymous",
                self.config.default_access_level,
                AuthMethod::Anonymous,
            ));
        };

        if let Some(value) = strip_scheme(header, "Bearer") {
            self.from_token(value)
        } else if let Some(value) = strip_scheme(header, "ApiKey") {
            self.from_api_key(value)
        } else if let Some(value) = strip_scheme(header, "HMAC-SHA256") {
            self.from_signature(value, operation)
        } else if !header.contains(char::is_whitespace) {
            self.from_api_key(header)
        } else {
            Err(AuthError::authentication("unsupported authorization scheme"))
        }
    }

    fn from_token(&self, value: &str) -> Result<AuthCredentials, AuthError> {
        let claims = token::verify(&self.secret, value)
            .map_err(|e| AuthError::authentication(e.to_string()))?;
        Ok(AuthCredentials::new(claims.sub, claims.access_level, AuthMethod::Token)
            .with_expiry(claims.exp)
            .with_operations(claims.operations))
    }

    fn from_api_key(&self, key: &str) -> Result<AuthCredentials, AuthError> {
        let registry = self.api_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let record = registry
            .lookup(key)
            .ok_or_else(|| AuthError::authentication("unknown API key"))?;
        Ok(
            AuthCredentials::new(record.client_id.clone(), record.access_level, AuthMethod::ApiKey)
                .with_expiry(record.expires_at)
                .with_operations(record.operations.clone()),
        )
    }

    fn from_signature(&self, value: &str, operation: &str) -> Result<AuthCredentials, AuthError> {
        let mut parts = value.rsplitn(3, ':');
        let (Some(signature), Some(timestamp), Some(client)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::authentication(
                "signature must be client:timestamp:signature",
            ));
        };
        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::authentication("signature timestamp is not an integer"))?;

        let now = unix_now() as i64;
        if now.abs_diff(timestamp) > self.config.hmac_max_skew_secs {
            return Err(AuthError::authentication(
                "signature timestamp outside allowed skew",
            ));
        }

        let expected = token::request_signature(&self.secret, client, operation, timestamp);
        if !token::signatures_match(signature, &expected) {
            return Err(AuthError::authentication("invalid request signature"));
        }
        Ok(AuthCredentials::new(client, AccessLevel::Internal, AuthMethod::Hmac))
    }

    fn authorize(
        &self,
        creds: AuthCredentials,
        operation: &str,
    ) -> Result<AuthCredentials, AuthError> {
        if creds.is_expired() {
            return Err(AuthError::Expired {
                client_id: creds.client_id,
            });
        }
        if !creds.permits(operation) || required_level(operation) > creds.access_level {
            return Err(AuthError::AccessDenied {
                client_id: creds.client_id,
                level: creds.access_level,
                operation: operation.to_string(),
            });
        }
        Ok(creds)
    }

    fn report(
        &self,
        result: &Result<AuthCredentials, AuthError>,
        auth_header: Option<&str>,
        client_ip: Option<IpAddr>,
        operation: &str,
    ) {
        let ip = client_ip.map(|ip| ip.to_string());
        let header = auth_header.map(|h| preview(h, self.config.preview_length));
        match result {
            Ok(creds) => self.audit.log_security_event(
                SecurityEventType::AuthSuccess,
                Severity::Info,
                format!("Authenticated '{}' for {}", creds.client_id, operation),
                json!({
                    "client_id": creds.client_id,
                    "method": creds.method.as_str(),
                    "access_level": creds.access_level.as_str(),
                    "operation": operation,
                    "ip": ip,
                }),
            ),
            Err(error) => {
                let event_type = match error.kind() {
                    AuthErrorKind::Authentication => SecurityEventType::AuthFailure,
                    AuthErrorKind::Expired => SecurityEventType::AuthExpired,
                    AuthErrorKind::AccessDenied => SecurityEventType::AccessDenied,
                };
                self.audit.log_security_event(
                    event_type,
                    Severity::Warning,
                    error.to_string(),
                    json!({
                        "operation": operation,
                        "ip": ip,
                        "credential": header,
                    }),
                );
            }
        }
    }

    /// Register a new API key and return it. The key is not retrievable later.
    pub fn add_api_key(
        &self,
        client_id: &str,
        access_level: AccessLevel,
        ttl: Option<Duration>,
        operations: Option<BTreeSet<String>>,
    ) -> String {
        let record = ApiKeyRecord {
            client_id: client_id.to_string(),
            access_level,
            expires_at: ttl.map(|ttl| unix_now().saturating_add(ttl.as_secs())),
            operations,
        };
        let key = self
            .api_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(record);

        self.audit.log_security_event(
            SecurityEventType::ApiKeyChanged,
            Severity::Info,
            format!("API key added for '{}'", client_id),
            json!({
                "client_id": client_id,
                "access_level": access_level.as_str(),
                "action": "added",
            }),
        );
        key
    }

    /// Revoke `key`. Returns whether it existed.
    pub fn revoke_api_key(&self, key: &str) -> bool {
        let removed = self
            .api_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .revoke(key);

        if let Some(record) = &removed {
            self.audit.log_security_event(
                SecurityEventType::ApiKeyChanged,
                Severity::Info,
                format!("API key revoked for '{}'", record.client_id),
                json!({ "client_id": record.client_id, "action": "revoked" }),
            );
        }
        removed.is_some()
    }

    /// Mint a signed bearer token. `ttl` defaults to the configured lifetime.
    pub fn issue_token(
        &self,
        client_id: &str,
        access_level: AccessLevel,
        ttl: Option<Duration>,
        operations: Option<BTreeSet<String>>,
    ) -> String {
        let ttl = ttl.map_or(self.config.default_token_ttl_secs, |t| t.as_secs());
        let claims = TokenClaims {
            sub: client_id.to_string(),
            access_level,
            exp: Some(unix_now().saturating_add(ttl)),
            operations,
        };
        token::sign(&self.secret, &claims)
    }

    /// Signature a client sends as `HMAC-SHA256 client:timestamp:<this>`.
    pub fn hmac_signature(&self, client_id: &str, operation: &str, timestamp: i64) -> String {
        token::request_signature(&self.secret, client_id, operation, timestamp)
    }

    pub fn api_key_count(&self) -> usize {
        self.api_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop expired API keys.
    pub fn sweep(&self) -> usize {
        self.api_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_expired(unix_now())
    }
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (prefix, rest) = header.split_once(' ')?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| rest.trim())
        .filter(|rest| !rest.is_empty())
}

fn resolve_secret(config: &AuthConfig) -> Vec<u8> {
    if let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) {
        return secret.as_bytes().to_vec();
    }
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            return secret.into_bytes();
        }
    }
    tracing::warn!(
        "No auth secret configured; generated a per-process secret. Tokens will not survive a restart"
    );
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const SECRET: &[u8] = b"test-secret-0123456789";

    fn remote() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
    }

    fn authenticator(config: AuthConfig) -> (Authenticator, AuditSink) {
        let audit = AuditSink::new(64, false);
        (Authenticator::with_secret(config, SECRET, audit.clone()), audit)
    }

    fn remote_config() -> AuthConfig {
        AuthConfig {
            local_only: false,
            ..AuthConfig::default()
        }
    }

    #[test]
    fn loopback_is_admin_when_local_only() {
        let (auth, audit) = authenticator(AuthConfig::default());
        let creds = auth
            .authenticate_request(None, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), "reset_circuit")
            .unwrap();
        assert_eq!(creds.method, AuthMethod::Local);
        assert_eq!(creds.access_level, AccessLevel::Admin);
        assert_eq!(audit.count(SecurityEventType::AuthSuccess), 1);
    }

    #[test]
    fn mapped_ipv4_loopback_counts_as_local() {
        let (auth, _) = authenticator(AuthConfig::default());
        let mapped = Some(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()));
        let creds = auth
            .authenticate_request(None, mapped, "reset_circuit")
            .unwrap();
        assert_eq!(creds.method, AuthMethod::Local);
        assert_eq!(creds.access_level, AccessLevel::Admin);
    }

    #[test]
    fn loopback_is_not_trusted_without_local_only() {
        let (auth, _) = authenticator(remote_config());
        let err = auth
            .authenticate_request(None, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), "reset_circuit")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AccessDenied);
    }

    #[test]
    fn anonymous_gets_default_level() {
        let (auth, _) = authenticator(remote_config());
        let creds = auth.authenticate_request(None, remote(), "status").unwrap();
        assert_eq!(creds.method, AuthMethod::Anonymous);
        assert_eq!(creds.access_level, AccessLevel::Public);

        let err = auth
            .authenticate_request(None, remote(), "view_circuits")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AccessDenied);
    }

    #[test]
    fn bearer_token_round_trip_and_level_check() {
        let (auth, _) = authenticator(remote_config());
        let token = auth.issue_token("agent", AccessLevel::Internal, None, None);
        let header = format!("Bearer {token}");

        let creds = auth
            .authenticate_request(Some(&header), remote(), "view_circuits")
            .unwrap();
        assert_eq!(creds.client_id, "agent");
        assert_eq!(creds.method, AuthMethod::Token);

        let err = auth
            .authenticate_request(Some(&header), remote(), "reset_circuit")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AccessDenied);
    }

    #[test]
    fn expired_token_is_rejected() {
        let (auth, audit) = authenticator(remote_config());
        let token = token::sign(
            SECRET,
            &TokenClaims {
                sub: "agent".to_string(),
                access_level: AccessLevel::Admin,
                exp: Some(unix_now() - 10),
                operations: None,
            },
        );
        let err = auth
            .authenticate_request(Some(&format!("Bearer {token}")), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Expired);
        assert_eq!(audit.count(SecurityEventType::AuthExpired), 1);
    }

    #[test]
    fn forged_token_fails_authentication() {
        let (auth, audit) = authenticator(remote_config());
        let forged = token::sign(
            b"not-the-server-secret",
            &TokenClaims {
                sub: "mallory".to_string(),
                access_level: AccessLevel::Debug,
                exp: None,
                operations: None,
            },
        );
        let err = auth
            .authenticate_request(Some(&format!("Bearer {forged}")), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);
        assert_eq!(audit.count(SecurityEventType::AuthFailure), 1);
    }

    #[test]
    fn api_key_with_scheme_and_bare() {
        let (auth, _) = authenticator(remote_config());
        let key = auth.add_api_key("ci", AccessLevel::Admin, None, None);

        let creds = auth
            .authenticate_request(Some(&format!("ApiKey {key}")), remote(), "reset_circuit")
            .unwrap();
        assert_eq!(creds.method, AuthMethod::ApiKey);
        assert_eq!(creds.client_id, "ci");

        assert!(auth
            .authenticate_request(Some(&key), remote(), "reset_circuit")
            .is_ok());

        let err = auth
            .authenticate_request(Some("ApiKey tg_nope"), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);
    }

    #[test]
    fn revoked_key_stops_working() {
        let (auth, audit) = authenticator(remote_config());
        let key = auth.add_api_key("ci", AccessLevel::Internal, None, None);
        assert!(auth.revoke_api_key(&key));
        assert!(!auth.revoke_api_key(&key));
        assert_eq!(audit.count(SecurityEventType::ApiKeyChanged), 2);

        let err = auth
            .authenticate_request(Some(&key), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);
    }

    #[test]
    fn expired_api_key_is_rejected_and_swept() {
        let (auth, _) = authenticator(remote_config());
        let key = auth.api_keys.lock().unwrap().add(ApiKeyRecord {
            client_id: "old".to_string(),
            access_level: AccessLevel::Admin,
            expires_at: Some(unix_now() - 5),
            operations: None,
        });

        let err = auth
            .authenticate_request(Some(&key), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Expired);

        assert_eq!(auth.sweep(), 1);
        assert_eq!(auth.api_key_count(), 0);
    }

    #[test]
    fn operation_allow_list_is_enforced() {
        let (auth, _) = authenticator(remote_config());
        let ops: BTreeSet<String> = ["view_circuits".to_string()].into_iter().collect();
        let key = auth.add_api_key("scoped", AccessLevel::Debug, None, Some(ops));

        assert!(auth
            .authenticate_request(Some(&key), remote(), "view_circuits")
            .is_ok());
        let err = auth
            .authenticate_request(Some(&key), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AccessDenied);
    }

    #[test]
    fn hmac_signature_is_internal() {
        let (auth, _) = authenticator(remote_config());
        let ts = unix_now() as i64;
        let sig = auth.hmac_signature("runner", "view_operations", ts);
        let header = format!("HMAC-SHA256 runner:{ts}:{sig}");

        let creds = auth
            .authenticate_request(Some(&header), remote(), "view_operations")
            .unwrap();
        assert_eq!(creds.access_level, AccessLevel::Internal);
        assert_eq!(creds.method, AuthMethod::Hmac);

        // Signature binds the operation.
        let err = auth
            .authenticate_request(Some(&header), remote(), "view_circuits")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);
    }

    #[test]
    fn stale_hmac_timestamp_is_rejected() {
        let (auth, _) = authenticator(remote_config());
        let ts = unix_now() as i64 - 301;
        let sig = auth.hmac_signature("runner", "status", ts);
        let err = auth
            .authenticate_request(
                Some(&format!("HMAC-SHA256 runner:{ts}:{sig}")),
                remote(),
                "status",
            )
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);
    }

    #[test]
    fn unknown_scheme_and_unknown_operation() {
        let (auth, _) = authenticator(remote_config());
        let err = auth
            .authenticate_request(Some("Basic dXNlcjpwYXNz"), remote(), "status")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Authentication);

        let token = auth.issue_token("agent", AccessLevel::Internal, None, None);
        let err = auth
            .authenticate_request(Some(&format!("Bearer {token}")), remote(), "format_disk")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AccessDenied);
    }

    #[test]
    fn every_request_is_audited_once() {
        let (auth, audit) = authenticator(remote_config());
        let _ = auth.authenticate_request(None, remote(), "status");
        let _ = auth.authenticate_request(None, remote(), "view_audit");
        let _ = auth.authenticate_request(Some("Bearer x.y.z"), remote(), "status");
        assert_eq!(audit.recent().len(), 3);
    }
}
