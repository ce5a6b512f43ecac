//! Signed bearer tokens and HMAC request signatures.
//!
//! Token layout: `base64url(header).base64url(claims).base64url(sig)` where
//! `sig = HMAC-SHA256(secret, "<header>.<claims>")` over the encoded segments.

use std::collections::BTreeSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::access::AccessLevel;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"TGT"}"#;

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub access_level: AccessLevel,
    /// Expiry in Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is not three dot-separated segments")]
    Malformed,
    #[error("token segment is not valid base64url")]
    Encoding,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token claims are not valid JSON")]
    Claims,
}

fn mac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Mint a token for `claims`.
pub fn sign(secret: &[u8], claims: &TokenClaims) -> String {
    let header = URL_SAFE_NO_PAD.encode(TOKEN_HEADER);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(mac(secret, signing_input.as_bytes()));
    format!("{signing_input}.{signature}")
}

/// Check the signature and decode the claims. Expiry is left to the caller.
pub fn verify(secret: &[u8], token: &str) -> Result<TokenClaims, TokenError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Encoding)?;
    let expected = mac(secret, format!("{header}.{payload}").as_bytes());
    if provided.len() != expected.len() || !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
        return Err(TokenError::BadSignature);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Encoding)?;
    serde_json::from_slice(&payload).map_err(|_| TokenError::Claims)
}

/// Hex HMAC-SHA256 over `client:operation:timestamp`.
pub fn request_signature(secret: &[u8], client: &str, operation: &str, timestamp: i64) -> String {
    hex::encode(mac(secret, format!("{client}:{operation}:{timestamp}").as_bytes()))
}

/// Constant-time comparison of two hex signatures.
pub fn signatures_match(provided_hex: &str, expected_hex: &str) -> bool {
    let (Ok(provided), Ok(expected)) = (hex::decode(provided_hex), hex::decode(expected_hex)) else {
        return false;
    };
    provided.len() == expected.len() && bool::from(provided.as_slice().ct_eq(expected.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> TokenClaims {
        TokenClaims {
            sub: "agent-7".to_string(),
            access_level: AccessLevel::Internal,
            exp: Some(4_000_000_000),
            operations: None,
        }
    }

    #[test]
    fn signed_token_verifies() {
        let token = sign(b"0123456789abcdef", &claims());
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(verify(b"0123456789abcdef", &token).unwrap(), claims());
    }

    #[test]
    fn wrong_secret_is_bad_signature() {
        let token = sign(b"0123456789abcdef", &claims());
        assert_eq!(verify(b"another-secret-xx", &token), Err(TokenError::BadSignature));
    }

    #[test]
    fn tampered_payload_is_bad_signature() {
        let token = sign(b"0123456789abcdef", &claims());
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&TokenClaims {
                access_level: AccessLevel::Debug,
                ..claims()
            })
            .unwrap(),
        );
        parts[1] = &forged;
        assert_eq!(
            verify(b"0123456789abcdef", &parts.join(".")),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn malformed_tokens() {
        assert_eq!(verify(b"k", "abc"), Err(TokenError::Malformed));
        assert_eq!(verify(b"k", "a.b.c.d"), Err(TokenError::Malformed));
        assert_eq!(verify(b"k", "a.b.!!!"), Err(TokenError::Encoding));
    }

    #[test]
    fn request_signatures_compare() {
        let sig = request_signature(b"secret", "ci", "status", 1_700_000_000);
        assert_eq!(sig.len(), 64);
        assert!(signatures_match(&sig, &sig));
        assert!(!signatures_match(&sig, &request_signature(b"secret", "ci", "status", 1)));
        assert!(!signatures_match("zz", &sig));
    }
}
