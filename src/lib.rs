//! Trust-boundary guards for a local developer-tooling control plane.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller (agent / CLI / channel)
//!        │
//!        ▼
//!   ┌──────────────────────────── GuardContext ────────────────────────────┐
//!   │  http + admin ──▶ security::rate_limit ──▶ auth ──▶ admin handlers    │
//!   │  /channel     ──▶ security::connections (admit, meter every frame)    │
//!   │                                                                       │
//!   │  resilience::governor ──▶ exec (argv, cwd, env, deadline)             │
//!   │                      └──▶ fs   (paths, atomic writes, backups)        │
//!   │                                                                       │
//!   │  cross-cutting: config, observability (audit, metrics, logging),      │
//!   │                 lifecycle (shutdown, sweepers)                        │
//!   └───────────────────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fs;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::GuardConfig;
pub use context::GuardContext;
pub use error::GuardError;
pub use http::GuardServer;
pub use lifecycle::Shutdown;
