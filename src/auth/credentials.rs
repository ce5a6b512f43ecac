use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::access::AccessLevel;

/// How a caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Local,
    Anonymous,
    Token,
    ApiKey,
    Hmac,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Anonymous => "anonymous",
            Self::Token => "token",
            Self::ApiKey => "api_key",
            Self::Hmac => "hmac",
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthCredentials {
    pub client_id: String,
    pub access_level: AccessLevel,
    pub method: AuthMethod,
    /// Expiry in Unix seconds.
    pub expires_at: Option<u64>,
    /// When set, only these operations are permitted.
    pub allowed_operations: Option<BTreeSet<String>>,
}

impl AuthCredentials {
    pub fn new(client_id: impl Into<String>, access_level: AccessLevel, method: AuthMethod) -> Self {
        Self {
            client_id: client_id.into(),
            access_level,
            method,
            expires_at: None,
            allowed_operations: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<u64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_operations(mut self, operations: Option<BTreeSet<String>>) -> Self {
        self.allowed_operations = operations;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// True iff `now` is strictly past the expiry.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }

    pub fn permits(&self, operation: &str) -> bool {
        self.allowed_operations
            .as_ref()
            .map_or(true, |ops| ops.contains(operation))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
