//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → GuardContext builds every guard from its section
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; guards never observe a partial update
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    AdminConfig, AuthConfig, ChannelConfig, CommandConfig, FailureLimit, FailureLimitsConfig,
    GovernorConfig, GuardConfig, MaintenanceConfig, ObservabilityConfig, OperationLimits,
    PathConfig, SubprocessSecurityConfig,
};
