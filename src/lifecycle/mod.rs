//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build GuardContext → Spawn sweepers → Serve
//!
//! Maintenance (sweeper.rs):
//!     Every interval → component.sweep() until shutdown
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → server drains, sweepers exit
//! ```
//!
//! # Design Decisions
//! - One sweeper task per guard component; none shares a lock with another
//! - Shutdown is sticky: subscribers created after the trigger still observe it

pub mod shutdown;
pub mod signals;
pub mod sweeper;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
pub use sweeper::{spawn_sweeper, Sweep};
