//! Client-facing abuse controls.
//!
//! # Data Flow
//! ```text
//! Management request:
//!     → rate_limit.rs (blocked after repeated failures?)
//!     → auth (authenticate + authorize)
//!     → on credential failure: rate_limit.rs records "authentication"
//!
//! Channel connection:
//!     → connections.rs (ban / global cap / per-IP cap)
//!     → every inbound frame: connections.rs (size / lifetime / per-minute)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any check failure
//! - Each guard owns exactly one mutex; no lock spans components

pub mod connections;
pub mod rate_limit;

pub use connections::{
    ConnectionGovernor, ConnectionMetrics, ConnectionStats, ResourceError, ResourceErrorKind,
};
pub use rate_limit::{BlockedClient, FailureRateLimiter, FailureWindow, RateLimitExceeded};
