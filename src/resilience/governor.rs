//! Bounded async operation governor.
//!
//! # Call Flow
//! ```text
//! execute_bounded_operation(op_type, client, f)
//!     → circuit breaker (fail fast while OPEN / probe busy)
//!     → admission: in-flight per type, per-client window, in-flight memory
//!     → f() under the type's wall-clock deadline, with a resource monitor
//!       reporting CPU and duration ceilings that sit below that deadline
//!     → breaker bookkeeping, slot release, history record
//! ```
//!
//! All governor state lives behind one mutex that is never held across an
//! `.await`. A call that is dropped mid-flight still releases its slot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use super::monitor::{spawn_monitor, MonitorSpec};
use crate::config::{GovernorConfig, OperationLimits};
use crate::observability::audit::{AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

/// Which admission ceiling refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Concurrency,
    Rate,
    Memory,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrency => "concurrency",
            Self::Rate => "rate",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorErrorKind {
    LimitExceeded,
    CircuitOpen,
    Timeout,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum GovernorError<E> {
    #[error("{op_type}: {limit} limit exceeded ({current}/{max})")]
    LimitExceeded {
        op_type: String,
        limit: LimitKind,
        current: u64,
        max: u64,
    },

    #[error("circuit open for {op_type}")]
    CircuitOpen {
        op_type: String,
        retry_after: Option<Duration>,
    },

    #[error("{op_type} timed out after {}s", .timeout.as_secs())]
    Timeout { op_type: String, timeout: Duration },

    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> GovernorError<E> {
    pub fn kind(&self) -> GovernorErrorKind {
        match self {
            Self::LimitExceeded { .. } => GovernorErrorKind::LimitExceeded,
            Self::CircuitOpen { .. } => GovernorErrorKind::CircuitOpen,
            Self::Timeout { .. } => GovernorErrorKind::Timeout,
            Self::Failed(_) => GovernorErrorKind::Failed,
        }
    }

    /// Audit text that does not depend on `E` being displayable.
    fn describe(&self) -> String {
        match self {
            Self::LimitExceeded {
                op_type,
                limit,
                current,
                max,
            } => format!("{op_type}: {limit} limit exceeded ({current}/{max})"),
            Self::CircuitOpen { op_type, .. } => format!("circuit open for {op_type}"),
            Self::Timeout { op_type, timeout } => {
                format!("{op_type} timed out after {}s", timeout.as_secs())
            }
            Self::Failed(_) => "operation failed".to_string(),
        }
    }
}

/// How a governed call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Finalized record of one governed call.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    pub id: u64,
    pub op_type: String,
    pub client_id: String,
    /// Wall-clock start, Unix milliseconds.
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub peak_memory_mb: u64,
    pub outcome: OperationOutcome,
}

#[derive(Debug)]
struct ActiveOperation {
    op_type: String,
    client_id: String,
    started: Instant,
    started_at_ms: u64,
    memory_mb: Arc<AtomicU64>,
    is_probe: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperationInfo {
    pub id: u64,
    pub op_type: String,
    pub client_id: String,
    pub elapsed_ms: u64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub recorded: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub cancelled: usize,
    pub avg_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub active_operations: Vec<ActiveOperationInfo>,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    pub history: HistoryStats,
    pub tracked_clients: usize,
}

#[derive(Debug, Default)]
struct GovernorState {
    circuits: HashMap<String, CircuitBreaker>,
    active: HashMap<u64, ActiveOperation>,
    client_calls: HashMap<(String, String), VecDeque<Instant>>,
    history: VecDeque<OperationMetrics>,
}

pub struct OperationGovernor {
    state: Mutex<GovernorState>,
    config: GovernorConfig,
    audit: AuditSink,
    next_id: AtomicU64,
}

impl std::fmt::Debug for OperationGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Slot held by an admitted call; finishing or dropping it releases the slot.
struct InFlight<'a> {
    governor: &'a OperationGovernor,
    id: u64,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(mut self, outcome: OperationOutcome) {
        self.finished = true;
        self.governor.finish(self.id, outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.governor.finish(self.id, OperationOutcome::Cancelled);
        }
    }
}

impl OperationGovernor {
    pub fn new(config: GovernorConfig, audit: AuditSink) -> Self {
        Self {
            state: Mutex::new(GovernorState::default()),
            config,
            audit,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn limits_for(&self, op_type: &str) -> &OperationLimits {
        self.config.limits_for(op_type)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` as an `op_type` call on behalf of `client_id`, subject to the
    /// type's breaker, admission ceilings and deadline.
    pub async fn execute_bounded_operation<F, Fut, T, E>(
        &self,
        op_type: &str,
        client_id: &str,
        f: F,
    ) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let limits = self.config.limits_for(op_type).clone();
        let (id, memory_mb) = self.admit(op_type, client_id, &limits)?;
        let slot = InFlight {
            governor: self,
            id,
            finished: false,
        };

        let timeout = Duration::from_secs(limits.timeout_secs);
        let _monitor = spawn_monitor(MonitorSpec {
            operation_id: id,
            op_type: op_type.to_string(),
            interval: Duration::from_millis(self.config.monitor_interval_ms.max(1)),
            max_cpu_secs: limits.max_cpu_secs,
            max_duration: Duration::from_secs(limits.max_duration_secs),
            memory_mb,
            audit: self.audit.clone(),
        });

        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                slot.finish(OperationOutcome::Success);
                Ok(value)
            }
            Ok(Err(error)) => {
                slot.finish(OperationOutcome::Failure);
                Err(GovernorError::Failed(error))
            }
            Err(_) => {
                slot.finish(OperationOutcome::Timeout);
                self.audit.log_security_event(
                    SecurityEventType::OperationTimeout,
                    Severity::Warning,
                    format!("Operation {} timed out after {}s", op_type, timeout.as_secs()),
                    json!({
                        "operation_id": id,
                        "op_type": op_type,
                        "client_id": client_id,
                        "timeout_secs": timeout.as_secs(),
                    }),
                );
                Err(GovernorError::Timeout {
                    op_type: op_type.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Breaker check then admission, all under one lock acquisition.
    fn admit<E>(
        &self,
        op_type: &str,
        client_id: &str,
        limits: &OperationLimits,
    ) -> Result<(u64, Arc<AtomicU64>), GovernorError<E>> {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.rate_window_secs);

        let mut state = self.lock();
        let breaker = state
            .circuits
            .entry(op_type.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(
                    limits.circuit_breaker_threshold,
                    Duration::from_secs(limits.circuit_breaker_timeout_secs),
                )
            });

        let is_probe = match breaker.try_acquire(now) {
            Ok(is_probe) => is_probe,
            Err(rejection) => {
                drop(state);
                let error = GovernorError::CircuitOpen {
                    op_type: op_type.to_string(),
                    retry_after: rejection.retry_after,
                };
                self.reject(op_type, client_id, "circuit_open", &error.describe());
                return Err(error);
            }
        };

        if let Some((limit, current, max)) =
            Self::over_limit(&mut state, op_type, client_id, limits, now, window)
        {
            if is_probe {
                if let Some(breaker) = state.circuits.get_mut(op_type) {
                    breaker.release_probe();
                }
            }
            drop(state);
            let error = GovernorError::LimitExceeded {
                op_type: op_type.to_string(),
                limit,
                current,
                max,
            };
            self.reject(op_type, client_id, limit.as_str(), &error.describe());
            return Err(error);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let memory_mb = Arc::new(AtomicU64::new(0));
        state.active.insert(
            id,
            ActiveOperation {
                op_type: op_type.to_string(),
                client_id: client_id.to_string(),
                started: now,
                started_at_ms: unix_millis(),
                memory_mb: Arc::clone(&memory_mb),
                is_probe,
            },
        );
        state
            .client_calls
            .entry((op_type.to_string(), client_id.to_string()))
            .or_default()
            .push_back(now);
        let active = state.active.len();
        drop(state);

        metrics::set_active_operations(active);
        tracing::debug!(operation_id = id, op_type, client = %client_id, is_probe, "Operation admitted");
        Ok((id, memory_mb))
    }

    fn over_limit(
        state: &mut GovernorState,
        op_type: &str,
        client_id: &str,
        limits: &OperationLimits,
        now: Instant,
        window: Duration,
    ) -> Option<(LimitKind, u64, u64)> {
        let of_type: Vec<&ActiveOperation> = state
            .active
            .values()
            .filter(|op| op.op_type == op_type)
            .collect();

        if of_type.len() >= limits.max_concurrent {
            return Some((
                LimitKind::Concurrency,
                of_type.len() as u64,
                limits.max_concurrent as u64,
            ));
        }

        let memory: u64 = of_type
            .iter()
            .map(|op| op.memory_mb.load(Ordering::Relaxed))
            .sum();
        if !of_type.is_empty() && memory >= limits.max_memory_mb {
            return Some((LimitKind::Memory, memory, limits.max_memory_mb));
        }

        let key = (op_type.to_string(), client_id.to_string());
        if let Some(calls) = state.client_calls.get_mut(&key) {
            prune_window(calls, now, window);
            if calls.len() >= limits.max_per_minute {
                return Some((
                    LimitKind::Rate,
                    calls.len() as u64,
                    limits.max_per_minute as u64,
                ));
            }
        }
        None
    }

    fn reject(&self, op_type: &str, client_id: &str, reason: &'static str, message: &str) {
        metrics::record_operation(op_type, reason, Duration::ZERO);
        self.audit.log_security_event(
            SecurityEventType::OperationRejected,
            Severity::Warning,
            format!("Operation rejected: {}", message),
            json!({
                "op_type": op_type,
                "client_id": client_id,
                "reason": reason,
            }),
        );
    }

    fn finish(&self, id: u64, outcome: OperationOutcome) {
        let now = Instant::now();
        let (record, transition, active) = {
            let mut state = self.lock();
            let Some(op) = state.active.remove(&id) else {
                return;
            };

            let limits = self.config.limits_for(&op.op_type);
            let breaker = state
                .circuits
                .entry(op.op_type.clone())
                .or_insert_with(|| {
                    CircuitBreaker::new(
                        limits.circuit_breaker_threshold,
                        Duration::from_secs(limits.circuit_breaker_timeout_secs),
                    )
                });
            let transition = match outcome {
                OperationOutcome::Success => breaker.record_success(op.is_probe),
                OperationOutcome::Failure | OperationOutcome::Timeout => {
                    breaker.record_failure(now, op.is_probe)
                }
                OperationOutcome::Cancelled => {
                    if op.is_probe {
                        breaker.release_probe();
                    }
                    None
                }
            };

            let record = OperationMetrics {
                id,
                op_type: op.op_type,
                client_id: op.client_id,
                started_at_ms: op.started_at_ms,
                duration_ms: now.duration_since(op.started).as_millis() as u64,
                peak_memory_mb: op.memory_mb.load(Ordering::Relaxed),
                outcome,
            };
            if state.history.len() >= self.config.history_capacity.max(1) {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
            (record, transition, state.active.len())
        };

        metrics::set_active_operations(active);
        metrics::record_operation(
            &record.op_type,
            outcome.as_str(),
            Duration::from_millis(record.duration_ms),
        );
        tracing::debug!(
            operation_id = id,
            op_type = %record.op_type,
            outcome = outcome.as_str(),
            duration_ms = record.duration_ms,
            "Operation finished"
        );

        if let Some(state) = transition {
            self.report_transition(&record.op_type, state, "operation outcome");
        }
    }

    fn report_transition(&self, op_type: &str, state: CircuitState, cause: &str) {
        metrics::record_circuit_state(op_type, state.metric_value());
        let (event_type, severity) = match state {
            CircuitState::Open => (SecurityEventType::CircuitOpened, Severity::Error),
            _ => (SecurityEventType::CircuitClosed, Severity::Info),
        };
        self.audit.log_security_event(
            event_type,
            severity,
            format!("Circuit for {} is now {}", op_type, state),
            json!({ "op_type": op_type, "state": state.as_str(), "cause": cause }),
        );
    }

    /// Current breaker state; types never seen are `Closed`.
    pub fn circuit_state(&self, op_type: &str) -> CircuitState {
        self.lock()
            .circuits
            .get(op_type)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Force a breaker closed. Returns whether the type had a breaker.
    pub fn reset_circuit(&self, op_type: &str) -> bool {
        let found = match self.lock().circuits.get_mut(op_type) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        };
        if found {
            self.report_transition(op_type, CircuitState::Closed, "manual reset");
        }
        found
    }

    pub fn status(&self) -> GovernorStatus {
        let now = Instant::now();
        let state = self.lock();

        let mut active_operations: Vec<ActiveOperationInfo> = state
            .active
            .iter()
            .map(|(id, op)| ActiveOperationInfo {
                id: *id,
                op_type: op.op_type.clone(),
                client_id: op.client_id.clone(),
                elapsed_ms: now.duration_since(op.started).as_millis() as u64,
                memory_mb: op.memory_mb.load(Ordering::Relaxed),
            })
            .collect();
        active_operations.sort_by_key(|op| op.id);

        let circuits = state
            .circuits
            .iter()
            .map(|(op_type, breaker)| (op_type.clone(), breaker.snapshot(now)))
            .collect();

        let mut history = HistoryStats {
            recorded: state.history.len(),
            ..HistoryStats::default()
        };
        let mut total_ms = 0u64;
        for record in &state.history {
            total_ms += record.duration_ms;
            match record.outcome {
                OperationOutcome::Success => history.successes += 1,
                OperationOutcome::Failure => history.failures += 1,
                OperationOutcome::Timeout => history.timeouts += 1,
                OperationOutcome::Cancelled => history.cancelled += 1,
            }
        }
        if history.recorded > 0 {
            history.avg_duration_ms = total_ms / history.recorded as u64;
        }

        GovernorStatus {
            active_operations,
            circuits,
            history,
            tracked_clients: state.client_calls.len(),
        }
    }

    /// Most recent finalized records, newest first.
    pub fn recent_operations(&self, limit: usize) -> Vec<OperationMetrics> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Drop expired client windows and pristine breakers.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.rate_window_secs);
        let mut state = self.lock();

        let before = state.client_calls.len() + state.circuits.len();
        state.client_calls.retain(|_, calls| {
            prune_window(calls, now, window);
            !calls.is_empty()
        });
        let busy: Vec<String> = state.active.values().map(|op| op.op_type.clone()).collect();
        state
            .circuits
            .retain(|op_type, breaker| !breaker.is_pristine() || busy.contains(op_type));
        before - (state.client_calls.len() + state.circuits.len())
    }
}

fn prune_window(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = calls.front() {
        if now.duration_since(*oldest) >= window {
            calls.pop_front();
        } else {
            break;
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
