//! Command execution guard.
//!
//! # Data Flow
//! ```text
//! ExecRequest
//!     → validate.rs  (argv structure, dangerous patterns, executable policy)
//!     → cwd.rs       (working directory)
//!     → environment.rs (strip injection keys and values)
//!     → runner.rs    (timeout value, spawn, wait under deadline)
//!     → ExecOutput
//! ```
//!
//! # Design Decisions
//! - Every check runs before anything is spawned
//! - No shell is ever involved; argv goes straight to the OS
//! - Each outcome is audited exactly once, with a truncated preview

mod cwd;
mod environment;
mod runner;
mod validate;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::config::CommandConfig;
use crate::fs::PathGuard;
use crate::observability::audit::{preview, AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

pub use runner::{ExecOutput, ExecRequest};
pub use validate::ValidatedCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    Structure,
    Injection,
    Executable,
    Environment,
    Cwd,
    TimeoutValue,
    Timeout,
    Spawn,
    NonZeroExit,
}

impl CommandErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::Injection => "injection",
            Self::Executable => "executable",
            Self::Environment => "environment",
            Self::Cwd => "cwd",
            Self::TimeoutValue => "timeout_value",
            Self::Timeout => "timeout",
            Self::Spawn => "spawn",
            Self::NonZeroExit => "non_zero_exit",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,

    #[error("command length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },

    #[error("argument {index} length {length} exceeds maximum {max}")]
    ArgTooLong {
        index: usize,
        length: usize,
        max: usize,
    },

    #[error("dangerous pattern ({pattern}) in argument {index}")]
    DangerousPattern { index: usize, pattern: &'static str },

    #[error("executable '{name}' not found")]
    ExecutableNotFound { name: String },

    #[error("executable '{name}' is blocked")]
    ExecutableBlocked { name: String },

    #[error("executable '{name}' is not in the allowed set")]
    ExecutableNotAllowed { name: String },

    #[error("environment rejected: {reason}")]
    Environment { reason: String },

    #[error("working directory {} rejected: {reason}", .path.display())]
    Cwd { path: PathBuf, reason: String },

    #[error("invalid timeout: {reason}")]
    TimeoutValue { reason: String },

    #[error("command '{preview}' timed out after {}s", .timeout.as_secs_f64())]
    Timeout { preview: String, timeout: Duration },

    #[error("failed to run '{preview}': {source}")]
    Spawn {
        preview: String,
        source: std::io::Error,
    },

    #[error("command '{preview}' exited with status {code:?}")]
    NonZeroExit {
        preview: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn kind(&self) -> CommandErrorKind {
        match self {
            Self::Empty | Self::TooLong { .. } | Self::ArgTooLong { .. } => {
                CommandErrorKind::Structure
            }
            Self::DangerousPattern { .. } => CommandErrorKind::Injection,
            Self::ExecutableNotFound { .. }
            | Self::ExecutableBlocked { .. }
            | Self::ExecutableNotAllowed { .. } => CommandErrorKind::Executable,
            Self::Environment { .. } => CommandErrorKind::Environment,
            Self::Cwd { .. } => CommandErrorKind::Cwd,
            Self::TimeoutValue { .. } => CommandErrorKind::TimeoutValue,
            Self::Timeout { .. } => CommandErrorKind::Timeout,
            Self::Spawn { .. } => CommandErrorKind::Spawn,
            Self::NonZeroExit { .. } => CommandErrorKind::NonZeroExit,
        }
    }

    /// Failure category for the per-client failure limiter, when the error
    /// indicates hostile input rather than an ordinary failure.
    pub fn failure_category(&self) -> Option<&'static str> {
        match self.kind() {
            CommandErrorKind::Injection | CommandErrorKind::Executable => {
                Some("command_injection")
            }
            CommandErrorKind::Cwd => Some("path_traversal"),
            _ => None,
        }
    }
}

/// Validates and runs subprocesses.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    config: CommandConfig,
    paths: PathGuard,
    audit: AuditSink,
}

impl CommandGuard {
    pub fn new(config: CommandConfig, paths: PathGuard, audit: AuditSink) -> Self {
        Self {
            config,
            paths,
            audit,
        }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    fn preview(&self, value: &str) -> String {
        preview(value, self.config.preview_length)
    }

    /// Audit a pre-spawn rejection and hand the error back.
    fn reject(&self, subject: &str, error: CommandError) -> CommandError {
        metrics::record_command("blocked");
        self.audit.log_security_event(
            SecurityEventType::CommandBlocked,
            Severity::Warning,
            format!("Command rejected: {}", error),
            json!({
                "kind": error.kind().as_str(),
                "subject": self.preview(subject),
            }),
        );
        error
    }
}
