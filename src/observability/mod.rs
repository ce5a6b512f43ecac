//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every guard produces:
//!     → audit.rs (security events: tracing + recent ring + optional JSON lines)
//!     → metrics.rs (counters, gauges, histograms)
//!     → logging.rs (subscriber setup, debug toggle)
//! ```
//!
//! # Design Decisions
//! - Security events are reported once per decision, never per retry
//! - Sensitive values only ever appear as bounded previews
//! - Metrics are cheap (no-op without an exporter)

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditSink, SecurityEvent, SecurityEventType, Severity};
