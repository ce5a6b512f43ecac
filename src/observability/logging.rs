//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Resolve the process-wide debug toggle
//!
//! # Design Decisions
//! - `RUST_LOG` wins over configured levels when present
//! - The debug toggle is read once at startup and never re-evaluated

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that turns on verbose security logging.
pub const DEBUG_ENV: &str = "TOOLGUARD_DEBUG";

static DEBUG_TOGGLE: OnceLock<bool> = OnceLock::new();

/// Resolve the debug toggle from the config flag and `TOOLGUARD_DEBUG`.
///
/// The first call fixes the value for the life of the process.
pub fn debug_enabled(config_flag: bool) -> bool {
    *DEBUG_TOGGLE.get_or_init(|| {
        config_flag
            || std::env::var(DEBUG_ENV)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
    })
}

/// Default filter directive for a log level.
pub fn default_directive(log_level: &str, debug: bool) -> String {
    let level = if debug { "debug" } else { log_level };
    format!("toolguard={level},security_audit={level},tower_http={level}")
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(log_level: &str, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive(log_level, debug).into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_overrides_level() {
        assert_eq!(
            default_directive("warn", true),
            "toolguard=debug,security_audit=debug,tower_http=debug"
        );
        assert!(default_directive("warn", false).starts_with("toolguard=warn"));
    }
}
