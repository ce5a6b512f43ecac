//! Multi-method authenticator.
//!
//! Resolves a caller from a loopback peer, a signed bearer token, an API key
//! or an HMAC request signature, then authorizes the requested operation
//! against a static table of minimum access levels.

pub mod access;
pub mod api_keys;
pub mod authenticator;
pub mod credentials;
pub mod token;

pub use access::{required_level, AccessLevel};
pub use authenticator::{AuthError, AuthErrorKind, Authenticator};
pub use credentials::{AuthCredentials, AuthMethod};
