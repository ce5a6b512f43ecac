//! HTTP surface subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (loopback by default)
//!     → server.rs (Axum setup, request ID, trace, timeout layers)
//!     → /admin/*  → admin auth middleware → admin handlers
//!     → /channel  → websocket.rs (connection governor, per-frame metering)
//! ```

pub mod request;
pub mod server;
pub mod websocket;

pub use request::{ClientIp, X_REQUEST_ID};
pub use server::{AppState, GuardServer};
