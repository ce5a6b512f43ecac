//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, timeouts ordered)
//! - Validate addresses before anything binds to them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{FailureLimit, GuardConfig, OperationLimits};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let command = &config.command;
    if command.max_arg_length == 0 {
        errors.push(ValidationError::new("command.max_arg_length", "must be > 0"));
    }
    if command.max_command_length < command.max_arg_length {
        errors.push(ValidationError::new(
            "command.max_command_length",
            "must be >= command.max_arg_length",
        ));
    }
    if !(command.max_timeout_secs.is_finite() && command.max_timeout_secs > 0.0) {
        errors.push(ValidationError::new("command.max_timeout_secs", "must be > 0"));
    }
    if !(command.default_timeout_secs > 0.0
        && command.default_timeout_secs <= command.max_timeout_secs)
    {
        errors.push(ValidationError::new(
            "command.default_timeout_secs",
            "must be > 0 and <= command.max_timeout_secs",
        ));
    }
    if let Some(allowed) = &command.allowed_executables {
        for name in allowed.intersection(&command.blocked_executables) {
            errors.push(ValidationError::new(
                "command.allowed_executables",
                format!("'{}' is also blocked", name),
            ));
        }
    }

    if config.paths.max_path_length == 0 {
        errors.push(ValidationError::new("paths.max_path_length", "must be > 0"));
    }

    check_limits("governor.defaults", &config.governor.defaults, &mut errors);
    for (name, limits) in &config.governor.operations {
        check_limits(&format!("governor.operations.{}", name), limits, &mut errors);
    }
    if config.governor.monitor_interval_ms == 0 {
        errors.push(ValidationError::new("governor.monitor_interval_ms", "must be > 0"));
    }
    if config.governor.history_capacity == 0 {
        errors.push(ValidationError::new("governor.history_capacity", "must be > 0"));
    }
    if config.governor.rate_window_secs == 0 {
        errors.push(ValidationError::new("governor.rate_window_secs", "must be > 0"));
    }

    if let Some(secret) = &config.auth.secret {
        if secret.len() < 16 {
            errors.push(ValidationError::new("auth.secret", "must be at least 16 bytes"));
        }
    }
    if config.auth.hmac_max_skew_secs == 0 {
        errors.push(ValidationError::new("auth.hmac_max_skew_secs", "must be > 0"));
    }

    check_failure_limit("failure_limits.default", &config.failure_limits.default, &mut errors);
    for (name, limit) in &config.failure_limits.categories {
        check_failure_limit(&format!("failure_limits.categories.{}", name), limit, &mut errors);
    }

    let channel = &config.channel;
    if channel.max_connections == 0 {
        errors.push(ValidationError::new("channel.max_connections", "must be > 0"));
    }
    if channel.max_connections_per_ip == 0 || channel.max_connections_per_ip > channel.max_connections {
        errors.push(ValidationError::new(
            "channel.max_connections_per_ip",
            "must be > 0 and <= channel.max_connections",
        ));
    }
    if channel.max_message_size == 0 {
        errors.push(ValidationError::new("channel.max_message_size", "must be > 0"));
    }
    if channel.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("channel.cleanup_interval_secs", "must be > 0"));
    }
    if config.maintenance.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("maintenance.sweep_interval_secs", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }
    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_limits(field: &str, limits: &OperationLimits, errors: &mut Vec<ValidationError>) {
    if limits.max_concurrent == 0 {
        errors.push(ValidationError::new(format!("{}.max_concurrent", field), "must be > 0"));
    }
    if limits.max_per_minute == 0 {
        errors.push(ValidationError::new(format!("{}.max_per_minute", field), "must be > 0"));
    }
    if limits.max_duration_secs == 0 {
        errors.push(ValidationError::new(format!("{}.max_duration_secs", field), "must be > 0"));
    }
    if limits.timeout_secs < limits.max_duration_secs {
        errors.push(ValidationError::new(
            format!("{}.timeout_secs", field),
            "must be >= max_duration_secs",
        ));
    }
    if limits.circuit_breaker_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{}.circuit_breaker_threshold", field),
            "must be > 0",
        ));
    }
}

fn check_failure_limit(field: &str, limit: &FailureLimit, errors: &mut Vec<ValidationError>) {
    if limit.max_failures == 0 {
        errors.push(ValidationError::new(format!("{}.max_failures", field), "must be > 0"));
    }
    if limit.window_secs == 0 {
        errors.push(ValidationError::new(format!("{}.window_secs", field), "must be > 0"));
    }
}
