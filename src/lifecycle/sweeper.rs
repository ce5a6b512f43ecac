//! Periodic maintenance.
//!
//! Each guard component that accumulates per-client state implements
//! [`Sweep`]; the context spawns one [`spawn_sweeper`] task per component.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::auth::Authenticator;
use crate::resilience::OperationGovernor;
use crate::security::{ConnectionGovernor, FailureRateLimiter};

/// A component with expirable state.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drop expired state. Returns how many entries were removed.
    fn sweep(&self) -> usize;
}

impl Sweep for OperationGovernor {
    fn name(&self) -> &'static str {
        "operation_governor"
    }

    fn sweep(&self) -> usize {
        OperationGovernor::sweep(self)
    }
}

impl Sweep for FailureRateLimiter {
    fn name(&self) -> &'static str {
        "failure_rate_limiter"
    }

    fn sweep(&self) -> usize {
        FailureRateLimiter::sweep(self)
    }
}

impl Sweep for ConnectionGovernor {
    fn name(&self) -> &'static str {
        "connection_governor"
    }

    fn sweep(&self) -> usize {
        ConnectionGovernor::sweep(self)
    }
}

impl Sweep for Authenticator {
    fn name(&self) -> &'static str {
        "authenticator"
    }

    fn sweep(&self) -> usize {
        Authenticator::sweep(self)
    }
}

/// Run `target.sweep()` every `interval` until shutdown fires.
pub fn spawn_sweeper(
    target: Arc<dyn Sweep>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = target.name();
        let period = interval.max(Duration::from_millis(10));
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(component = name, interval_ms = period.as_millis() as u64, "Sweeper starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = target.sweep();
                    if removed > 0 {
                        tracing::debug!(component = name, removed, "Swept expired state");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(component = name, "Sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}
