//! Per-client failure rate limiting.
//!
//! Unlike a request-rate limiter this one only counts *failures*
//! (rejected commands, traversal attempts, bad credentials). Each
//! `(client, category)` pair keeps a sliding window of failure instants;
//! reaching the category's budget blocks the client outright for the
//! category's block duration.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use crate::config::FailureLimitsConfig;
use crate::observability::audit::{AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

/// Sliding window of failure instants for one `(client, category)`.
#[derive(Debug, Default)]
pub struct FailureWindow {
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
struct Block {
    until: Instant,
    category: String,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<(String, String), FailureWindow>,
    blocked: HashMap<String, Block>,
}

/// Raised when a blocked client attempts an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("client '{client_id}' is blocked for {category} failures; retry in {}s", .retry_after.as_secs())]
pub struct RateLimitExceeded {
    pub client_id: String,
    pub category: String,
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    pub fn kind(&self) -> &'static str {
        "rate_limit_exceeded"
    }
}

/// A currently blocked client, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedClient {
    pub client_id: String,
    pub category: String,
    pub remaining_secs: u64,
}

#[derive(Debug)]
pub struct FailureRateLimiter {
    state: Mutex<LimiterState>,
    config: FailureLimitsConfig,
    audit: AuditSink,
}

impl FailureRateLimiter {
    pub fn new(config: FailureLimitsConfig, audit: AuditSink) -> Self {
        Self {
            state: Mutex::new(LimiterState::default()),
            config,
            audit,
        }
    }

    /// Record a failure. Returns `true` if this failure triggered a block.
    pub fn record_failure(&self, client_id: &str, category: &str) -> bool {
        let limit = self.config.limit_for(category);
        let window = Duration::from_secs(limit.window_secs);
        let now = Instant::now();

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let key = (client_id.to_string(), category.to_string());
            let entry = state.windows.entry(key.clone()).or_default();
            entry.prune(now, window);
            entry.failures.push_back(now);

            if entry.failures.len() < limit.max_failures {
                return false;
            }

            state.windows.remove(&key);
            state.blocked.insert(
                client_id.to_string(),
                Block {
                    until: now + Duration::from_secs(limit.block_secs),
                    category: category.to_string(),
                },
            );
        }

        metrics::record_client_block(category);
        self.audit.log_security_event(
            SecurityEventType::ClientBlocked,
            Severity::Warning,
            format!("Client '{}' blocked after repeated {} failures", client_id, category),
            json!({
                "client_id": client_id,
                "category": category,
                "max_failures": limit.max_failures,
                "window_secs": limit.window_secs,
                "block_secs": limit.block_secs,
            }),
        );
        true
    }

    /// Whether `client_id` is currently blocked. Expired blocks are cleared.
    pub fn is_blocked(&self, client_id: &str) -> bool {
        self.check(client_id).is_err()
    }

    pub fn check(&self, client_id: &str) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(block) = state.blocked.get(client_id) else {
            return Ok(());
        };
        if now < block.until {
            return Err(RateLimitExceeded {
                client_id: client_id.to_string(),
                category: block.category.clone(),
                retry_after: block.until - now,
            });
        }
        state.blocked.remove(client_id);
        tracing::info!(client = %client_id, "Client block expired");
        Ok(())
    }

    /// Failures currently counted for `(client, category)`.
    pub fn failure_count(&self, client_id: &str, category: &str) -> usize {
        let window = Duration::from_secs(self.config.limit_for(category).window_secs);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (client_id.to_string(), category.to_string());
        match state.windows.get_mut(&key) {
            Some(entry) => {
                entry.prune(now, window);
                entry.len()
            }
            None => 0,
        }
    }

    pub fn blocked_clients(&self) -> Vec<BlockedClient> {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut clients: Vec<BlockedClient> = state
            .blocked
            .iter()
            .filter(|(_, block)| now < block.until)
            .map(|(client_id, block)| BlockedClient {
                client_id: client_id.clone(),
                category: block.category.clone(),
                remaining_secs: (block.until - now).as_secs(),
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Clear expired blocks and empty windows. Returns entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let blocks_before = state.blocked.len();
        state.blocked.retain(|_, block| now < block.until);
        let mut removed = blocks_before - state.blocked.len();

        let windows_before = state.windows.len();
        let config = &self.config;
        state.windows.retain(|(_, category), entry| {
            entry.prune(now, Duration::from_secs(config.limit_for(category).window_secs));
            !entry.is_empty()
        });
        removed += windows_before - state.windows.len();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureLimit;

    fn limiter() -> (FailureRateLimiter, AuditSink) {
        let audit = AuditSink::new(64, false);
        (
            FailureRateLimiter::new(FailureLimitsConfig::default(), audit.clone()),
            audit,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn third_injection_failure_blocks() {
        let (limiter, audit) = limiter();
        assert!(!limiter.record_failure("agent", "command_injection"));
        assert!(!limiter.record_failure("agent", "command_injection"));
        assert!(limiter.record_failure("agent", "command_injection"));

        assert!(limiter.is_blocked("agent"));
        assert_eq!(limiter.failure_count("agent", "command_injection"), 0);
        assert_eq!(audit.count(SecurityEventType::ClientBlocked), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn block_expires_after_block_duration() {
        let (limiter, _) = limiter();
        for _ in 0..3 {
            limiter.record_failure("agent", "command_injection");
        }

        tokio::time::advance(Duration::from_secs(1_799)).await;
        assert!(limiter.is_blocked("agent"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.is_blocked("agent"));
        assert!(limiter.blocked_clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let (limiter, _) = limiter();
        limiter.record_failure("agent", "command_injection");
        limiter.record_failure("agent", "command_injection");

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!limiter.record_failure("agent", "command_injection"));
        assert!(!limiter.is_blocked("agent"));
        assert_eq!(limiter.failure_count("agent", "command_injection"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_category_uses_default_budget() {
        let (limiter, _) = limiter();
        for _ in 0..9 {
            assert!(!limiter.record_failure("agent", "lint_abuse"));
        }
        assert!(limiter.record_failure("agent", "lint_abuse"));
    }

    #[tokio::test(start_paused = true)]
    async fn categories_and_clients_are_independent() {
        let (limiter, _) = limiter();
        limiter.record_failure("a", "command_injection");
        limiter.record_failure("a", "command_injection");
        limiter.record_failure("a", "path_traversal");
        limiter.record_failure("b", "command_injection");

        assert!(!limiter.is_blocked("a"));
        assert!(!limiter.is_blocked("b"));
        assert_eq!(limiter.failure_count("a", "command_injection"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn check_reports_category_and_retry_after() {
        let mut config = FailureLimitsConfig::default();
        config
            .categories
            .insert("authentication".to_string(), FailureLimit::new(1, 60, 120));
        let limiter = FailureRateLimiter::new(config, AuditSink::new(8, false));

        assert!(limiter.record_failure("10.0.0.1", "authentication"));
        let err = limiter.check("10.0.0.1").unwrap_err();
        assert_eq!(err.category, "authentication");
        assert_eq!(err.retry_after, Duration::from_secs(120));

        let blocked = limiter.blocked_clients();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].remaining_secs, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_expired_state() {
        let (limiter, _) = limiter();
        limiter.record_failure("x", "default");
        for _ in 0..3 {
            limiter.record_failure("y", "command_injection");
        }

        tokio::time::advance(Duration::from_secs(1_801)).await;
        // One expired block plus one stale window.
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.sweep(), 0);
    }
}
