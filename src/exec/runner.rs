//! Subprocess spawning under a deadline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tokio::time::Instant;

use super::{CommandError, CommandGuard};
use crate::observability::audit::{SecurityEventType, Severity};
use crate::observability::metrics;

/// A command to run, with optional working directory, environment and deadline.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    timeout_secs: Option<f64>,
    check: bool,
}

impl ExecRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Replace the child's environment. Without this the parent's is inherited.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Treat a non-zero exit as an error.
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }
}

/// Captured result of a finished child.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl CommandGuard {
    /// Bound a caller-supplied timeout.
    pub fn validate_timeout(&self, secs: f64) -> Result<Duration, CommandError> {
        let reason = if !secs.is_finite() {
            Some(format!("{secs} is not a finite number"))
        } else if secs <= 0.0 {
            Some(format!("{secs} must be positive"))
        } else if secs > self.config.max_timeout_secs {
            Some(format!(
                "{secs} exceeds maximum {}",
                self.config.max_timeout_secs
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(self.reject("timeout", CommandError::TimeoutValue { reason })),
            None => Ok(Duration::from_secs_f64(secs)),
        }
    }

    /// Validate everything, then run the command to completion or deadline.
    pub async fn execute_secure(&self, request: ExecRequest) -> Result<ExecOutput, CommandError> {
        let validated = self.validate_command(request.args.as_slice())?;
        let cwd = request
            .cwd
            .as_deref()
            .map(|p| self.validate_cwd(p))
            .transpose()?;
        let env = request
            .env
            .as_ref()
            .map(|e| self.sanitize_environment(e))
            .transpose()?;
        let timeout = self.validate_timeout(
            request
                .timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
        )?;

        let preview = self.preview(&validated.display());
        let mut command = Command::new(validated.executable());
        command
            .args(&validated.args()[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &env {
            command.env_clear().envs(env);
        }

        tracing::debug!(command = %preview, ?cwd, timeout_secs = timeout.as_secs_f64(), "Spawning command");
        let started = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => return Err(self.process_error(preview, source, started)),
        };

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(self.process_error(preview, source, started)),
            Err(_) => {
                metrics::record_command("timeout");
                self.audit.log_security_event(
                    SecurityEventType::CommandTimeout,
                    Severity::Warning,
                    format!("Command timed out after {:.1}s", timeout.as_secs_f64()),
                    json!({
                        "command": preview,
                        "timeout_secs": timeout.as_secs_f64(),
                    }),
                );
                return Err(CommandError::Timeout { preview, timeout });
            }
        };

        let result = ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };

        if result.success() {
            metrics::record_command("success");
            self.audit.log_security_event(
                SecurityEventType::CommandExecuted,
                Severity::Info,
                "Command completed",
                json!({
                    "command": preview,
                    "duration_ms": result.duration.as_millis() as u64,
                }),
            );
            return Ok(result);
        }

        metrics::record_command("failed");
        self.audit.log_security_event(
            SecurityEventType::CommandFailed,
            Severity::Warning,
            format!("Command exited with status {:?}", result.exit_code),
            json!({
                "command": preview,
                "exit_code": result.exit_code,
                "stderr": self.preview(&result.stderr),
            }),
        );
        if request.check {
            return Err(CommandError::NonZeroExit {
                preview,
                code: result.exit_code,
                stderr: self.preview(&result.stderr),
            });
        }
        Ok(result)
    }

    fn process_error(&self, preview: String, source: std::io::Error, started: Instant) -> CommandError {
        metrics::record_command("error");
        self.audit.log_security_event(
            SecurityEventType::CommandError,
            Severity::Error,
            format!("Command could not be run: {}", source),
            json!({
                "command": preview,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        CommandError::Spawn { preview, source }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, PathConfig};
    use crate::exec::CommandErrorKind;
    use crate::fs::PathGuard;
    use crate::observability::AuditSink;

    fn guard() -> (CommandGuard, AuditSink) {
        let audit = AuditSink::new(64, false);
        let paths = PathGuard::new(PathConfig::default(), audit.clone());
        (
            CommandGuard::new(CommandConfig::default(), paths, audit.clone()),
            audit,
        )
    }

    #[test]
    fn timeout_values() {
        let (guard, _) = guard();
        assert_eq!(guard.validate_timeout(1.5).unwrap(), Duration::from_millis(1500));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 3600.5] {
            let err = guard.validate_timeout(bad).unwrap_err();
            assert_eq!(err.kind(), CommandErrorKind::TimeoutValue, "value {bad}");
        }
        assert!(guard.validate_timeout(3600.0).is_ok());
    }

    #[tokio::test]
    async fn successful_command_is_captured_and_audited() {
        let (guard, audit) = guard();
        let output = guard
            .execute_secure(ExecRequest::new(["echo", "hello"]))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(audit.count(SecurityEventType::CommandExecuted), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_respects_check() {
        let (guard, audit) = guard();
        let output = guard
            .execute_secure(ExecRequest::new(["false"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(1));

        let err = guard
            .execute_secure(ExecRequest::new(["false"]).check(true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::NonZeroExit);
        assert_eq!(audit.count(SecurityEventType::CommandFailed), 2);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (guard, audit) = guard();
        let started = std::time::Instant::now();
        let err = guard
            .execute_secure(ExecRequest::new(["sleep", "5"]).timeout_secs(0.2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(audit.count(SecurityEventType::CommandTimeout), 1);
    }

    #[tokio::test]
    async fn validation_happens_before_spawn() {
        let (guard, audit) = guard();
        let err = guard
            .execute_secure(ExecRequest::new(["echo", "a;b"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::Injection);

        let err = guard
            .execute_secure(ExecRequest::new(["echo", "ok"]).timeout_secs(-1.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::TimeoutValue);

        assert_eq!(audit.count(SecurityEventType::CommandBlocked), 2);
        assert_eq!(audit.count(SecurityEventType::CommandExecuted), 0);
    }

    #[tokio::test]
    async fn explicit_environment_replaces_parent() {
        let (guard, _) = guard();
        let mut env = HashMap::new();
        env.insert("TOOLGUARD_PROBE".to_string(), "visible".to_string());
        env.insert("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string());

        let output = guard
            .execute_secure(ExecRequest::new(["env"]).env(env))
            .await
            .unwrap();
        assert!(output.stdout.contains("TOOLGUARD_PROBE=visible"));
        assert!(!output.stdout.contains("LD_PRELOAD"));
    }

    #[tokio::test]
    async fn cwd_is_applied() {
        let (guard, _) = guard();
        let dir = tempfile::tempdir().unwrap();
        let output = guard
            .execute_secure(ExecRequest::new(["pwd"]).cwd(dir.path()))
            .await
            .unwrap();
        assert_eq!(
            PathBuf::from(output.stdout.trim()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
