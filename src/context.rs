//! Composition root.
//!
//! A [`GuardContext`] is built once from a validated [`GuardConfig`] and
//! shared by `Arc` with every consumer: the management API, the channel
//! and any embedding code.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::exec::{CommandGuard, ExecOutput, ExecRequest};
use crate::fs::{PathGuard, SecurePath};
use crate::lifecycle::{spawn_sweeper, Shutdown, Sweep};
use crate::observability::audit::{AuditSink, AuditWriterTask};
use crate::resilience::OperationGovernor;
use crate::security::{ConnectionGovernor, FailureRateLimiter};

/// Every guard, built from one config and sharing one audit sink.
#[derive(Debug, Clone)]
pub struct GuardContext {
    pub config: Arc<GuardConfig>,
    pub audit: AuditSink,
    pub paths: PathGuard,
    pub commands: Arc<CommandGuard>,
    pub governor: Arc<OperationGovernor>,
    pub auth: Arc<Authenticator>,
    pub failures: Arc<FailureRateLimiter>,
    pub connections: Arc<ConnectionGovernor>,
}

impl GuardContext {
    /// Build every guard in dependency order, reporting to `audit`.
    pub fn new(config: GuardConfig, audit: AuditSink) -> Self {
        let paths = PathGuard::new(config.paths.clone(), audit.clone());
        let commands = CommandGuard::new(config.command.clone(), paths.clone(), audit.clone());
        let failures = FailureRateLimiter::new(config.failure_limits.clone(), audit.clone());
        let auth = Authenticator::new(config.auth.clone(), audit.clone());
        let governor = OperationGovernor::new(config.governor.clone(), audit.clone());
        let connections = ConnectionGovernor::new(config.channel.clone(), audit.clone());

        Self {
            config: Arc::new(config),
            audit,
            paths,
            commands: Arc::new(commands),
            governor: Arc::new(governor),
            auth: Arc::new(auth),
            failures: Arc::new(failures),
            connections: Arc::new(connections),
        }
    }

    /// Build the audit sink the observability section asks for, then the guards.
    ///
    /// When an audit file is configured the returned writer task must be spawned.
    pub fn from_config(
        config: GuardConfig,
        verbose: bool,
    ) -> Result<(Self, Option<AuditWriterTask>), GuardError> {
        let observability = &config.observability;
        let (audit, writer) = match &observability.audit_log_path {
            Some(path) => {
                let (sink, task) = AuditSink::with_file(path, observability.audit_buffer, verbose)?;
                (sink, Some(task))
            }
            None => (AuditSink::new(observability.audit_buffer, verbose), None),
        };
        Ok((Self::new(config, audit), writer))
    }

    /// Spawn one sweeper per stateful guard. They exit when `shutdown` fires.
    pub fn spawn_maintenance(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let every = Duration::from_secs(self.config.maintenance.sweep_interval_secs);
        let channel_every = Duration::from_secs(self.config.channel.cleanup_interval_secs);

        let targets: [(Arc<dyn Sweep>, Duration); 4] = [
            (self.governor.clone(), every),
            (self.failures.clone(), every),
            (self.auth.clone(), every),
            (self.connections.clone(), channel_every),
        ];
        targets
            .into_iter()
            .map(|(target, interval)| spawn_sweeper(target, interval, shutdown.subscribe()))
            .collect()
    }

    /// Run a command on behalf of `client_id`.
    ///
    /// Blocked clients are refused before validation; validation failures that
    /// look like probes count against the client.
    pub async fn execute_for(
        &self,
        client_id: &str,
        request: ExecRequest,
    ) -> Result<ExecOutput, GuardError> {
        self.failures.check(client_id)?;
        self.commands
            .execute_secure(request)
            .await
            .map_err(|e| self.count_failure(client_id, e.into()))
    }

    /// Validate a path on behalf of `client_id`, counting boundary probes.
    pub fn validate_path_for(
        &self,
        client_id: &str,
        path: impl AsRef<Path>,
        base: Option<&Path>,
    ) -> Result<SecurePath, GuardError> {
        self.failures.check(client_id)?;
        self.paths
            .validate_safe_path(path, base)
            .map_err(|e| self.count_failure(client_id, e.into()))
    }

    fn count_failure(&self, client_id: &str, error: GuardError) -> GuardError {
        if let Some(category) = error.failure_category() {
            self.failures.record_failure(client_id, category);
        }
        error
    }
}
