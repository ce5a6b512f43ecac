//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Governed call:
//!     → governor.rs (breaker check, admission ceilings, deadline)
//!     → monitor.rs (samples CPU / memory while the call runs)
//!     → circuit_breaker.rs (records the outcome per operation type)
//! ```
//!
//! # Design Decisions
//! - Every governed call has a deadline; a timeout counts as a failure
//! - One breaker per operation type, so one broken tool does not starve the rest
//! - Cancelling a call releases its slot and any half-open probe

pub mod circuit_breaker;
pub mod governor;
pub mod monitor;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use governor::{
    GovernorError, GovernorErrorKind, GovernorStatus, LimitKind, OperationGovernor,
    OperationMetrics, OperationOutcome,
};
pub use monitor::{sample_process, ResourceSample};
