//! Connection and message governance for the streaming channel.
//!
//! Tracks every live channel connection with its per-IP grouping, enforces
//! global and per-IP caps, bans IPs that hit their cap, and meters inbound
//! messages by size, lifetime count and a rolling one-minute rate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::observability::audit::{AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

const MESSAGE_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceErrorKind {
    IpBanned,
    ConnectionLimit,
    IpLimit,
    DuplicateConnection,
    UnknownConnection,
    MessageTooLarge,
    MessageLimit,
    MessageRate,
}

impl ResourceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpBanned => "ip_banned",
            Self::ConnectionLimit => "connection_limit",
            Self::IpLimit => "ip_limit",
            Self::DuplicateConnection => "duplicate_connection",
            Self::UnknownConnection => "unknown_connection",
            Self::MessageTooLarge => "message_too_large",
            Self::MessageLimit => "message_limit",
            Self::MessageRate => "message_rate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("ip {ip} is temporarily banned")]
    IpBanned { ip: IpAddr, retry_after: Duration },

    #[error("connection limit of {max} reached")]
    ConnectionLimit { max: usize },

    #[error("ip {ip} reached its limit of {max} connections")]
    IpLimit { ip: IpAddr, max: usize },

    #[error("connection '{client_id}' is already registered")]
    DuplicateConnection { client_id: String },

    #[error("unknown connection '{client_id}'")]
    UnknownConnection { client_id: String },

    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection '{client_id}' exhausted its budget of {max} messages")]
    MessageLimit { client_id: String, max: u64 },

    #[error("connection '{client_id}' exceeded {max} messages per minute")]
    MessageRate { client_id: String, max: usize },
}

impl ResourceError {
    pub fn kind(&self) -> ResourceErrorKind {
        match self {
            Self::IpBanned { .. } => ResourceErrorKind::IpBanned,
            Self::ConnectionLimit { .. } => ResourceErrorKind::ConnectionLimit,
            Self::IpLimit { .. } => ResourceErrorKind::IpLimit,
            Self::DuplicateConnection { .. } => ResourceErrorKind::DuplicateConnection,
            Self::UnknownConnection { .. } => ResourceErrorKind::UnknownConnection,
            Self::MessageTooLarge { .. } => ResourceErrorKind::MessageTooLarge,
            Self::MessageLimit { .. } => ResourceErrorKind::MessageLimit,
            Self::MessageRate { .. } => ResourceErrorKind::MessageRate,
        }
    }
}

/// Live accounting for one governed connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub client_id: String,
    pub ip: IpAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    recent_messages: VecDeque<Instant>,
}

impl ConnectionMetrics {
    fn new(client_id: String, ip: IpAddr, now: Instant) -> Self {
        Self {
            client_id,
            ip,
            connected_at: now,
            last_activity: now,
            message_count: 0,
            bytes_received: 0,
            bytes_sent: 0,
            recent_messages: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub client_id: String,
    pub ip: IpAddr,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub message_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub unique_ips: usize,
    pub banned_ips: usize,
    pub total_messages: u64,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Default)]
struct GovernorState {
    connections: HashMap<String, ConnectionMetrics>,
    by_ip: HashMap<IpAddr, HashSet<String>>,
    bans: HashMap<IpAddr, Instant>,
}

#[derive(Debug)]
pub struct ConnectionGovernor {
    state: Mutex<GovernorState>,
    config: ChannelConfig,
    audit: AuditSink,
}

impl ConnectionGovernor {
    pub fn new(config: ChannelConfig, audit: AuditSink) -> Self {
        Self {
            state: Mutex::new(GovernorState::default()),
            config,
            audit,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Check whether `client_id` from `ip` may open a connection.
    pub fn validate_new_connection(&self, client_id: &str, ip: IpAddr) -> Result<(), ResourceError> {
        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.admit(&mut state, client_id, ip, Instant::now())
        };
        result.map_err(|e| self.reject_connection(client_id, ip, e))
    }

    /// Admit and start tracking a connection. Re-checks every cap under the lock.
    pub fn register_connection(&self, client_id: &str, ip: IpAddr) -> Result<(), ResourceError> {
        let now = Instant::now();
        let active = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.admit(&mut state, client_id, ip, now) {
                drop(state);
                return Err(self.reject_connection(client_id, ip, e));
            }
            state.connections.insert(
                client_id.to_string(),
                ConnectionMetrics::new(client_id.to_string(), ip, now),
            );
            state
                .by_ip
                .entry(ip)
                .or_default()
                .insert(client_id.to_string());
            state.connections.len()
        };

        metrics::set_active_connections(active);
        tracing::debug!(client = %client_id, %ip, active, "Channel connection registered");
        Ok(())
    }

    fn admit(
        &self,
        state: &mut GovernorState,
        client_id: &str,
        ip: IpAddr,
        now: Instant,
    ) -> Result<(), ResourceError> {
        if let Some(until) = state.bans.get(&ip).copied() {
            if now < until {
                return Err(ResourceError::IpBanned {
                    ip,
                    retry_after: until - now,
                });
            }
            state.bans.remove(&ip);
        }

        if state.connections.contains_key(client_id) {
            return Err(ResourceError::DuplicateConnection {
                client_id: client_id.to_string(),
            });
        }

        if state.connections.len() >= self.config.max_connections {
            return Err(ResourceError::ConnectionLimit {
                max: self.config.max_connections,
            });
        }

        let from_ip = state.by_ip.get(&ip).map_or(0, HashSet::len);
        if from_ip >= self.config.max_connections_per_ip {
            state
                .bans
                .insert(ip, now + Duration::from_secs(self.config.ip_ban_secs));
            return Err(ResourceError::IpLimit {
                ip,
                max: self.config.max_connections_per_ip,
            });
        }

        Ok(())
    }

    fn reject_connection(&self, client_id: &str, ip: IpAddr, error: ResourceError) -> ResourceError {
        let kind = error.kind();
        metrics::record_channel_rejection(kind.as_str());
        self.audit.log_security_event(
            SecurityEventType::ConnectionRejected,
            Severity::Warning,
            format!("Channel connection rejected: {}", error),
            json!({
                "client_id": client_id,
                "ip": ip.to_string(),
                "kind": kind.as_str(),
            }),
        );
        error
    }

    /// Stop tracking a connection. Returns its final accounting, if it was known.
    pub fn unregister_connection(&self, client_id: &str) -> Option<ConnectionMetrics> {
        let (removed, active) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = remove_connection(&mut state, client_id);
            (removed, state.connections.len())
        };
        if removed.is_some() {
            metrics::set_active_connections(active);
            tracing::debug!(client = %client_id, active, "Channel connection unregistered");
        }
        removed
    }

    /// Meter an inbound message of `size` bytes. Accepted messages are recorded.
    pub fn validate_message(&self, client_id: &str, size: usize) -> Result<(), ResourceError> {
        let now = Instant::now();
        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.meter(&mut state, client_id, size, now)
        };

        result.map_err(|error| {
            let kind = error.kind();
            metrics::record_channel_rejection(kind.as_str());
            self.audit.log_security_event(
                SecurityEventType::MessageRejected,
                Severity::Warning,
                format!("Channel message rejected: {}", error),
                json!({
                    "client_id": client_id,
                    "size": size,
                    "kind": kind.as_str(),
                }),
            );
            error
        })
    }

    fn meter(
        &self,
        state: &mut GovernorState,
        client_id: &str,
        size: usize,
        now: Instant,
    ) -> Result<(), ResourceError> {
        let conn = state
            .connections
            .get_mut(client_id)
            .ok_or_else(|| ResourceError::UnknownConnection {
                client_id: client_id.to_string(),
            })?;

        if size > self.config.max_message_size {
            return Err(ResourceError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }

        if conn.message_count >= self.config.max_messages_per_connection {
            return Err(ResourceError::MessageLimit {
                client_id: client_id.to_string(),
                max: self.config.max_messages_per_connection,
            });
        }

        while let Some(oldest) = conn.recent_messages.front() {
            if now.duration_since(*oldest) >= MESSAGE_RATE_WINDOW {
                conn.recent_messages.pop_front();
            } else {
                break;
            }
        }
        if conn.recent_messages.len() >= self.config.max_messages_per_minute {
            return Err(ResourceError::MessageRate {
                client_id: client_id.to_string(),
                max: self.config.max_messages_per_minute,
            });
        }

        conn.recent_messages.push_back(now);
        conn.message_count += 1;
        conn.bytes_received += size as u64;
        conn.last_activity = now;
        Ok(())
    }

    /// Account for an outbound frame.
    pub fn record_sent(&self, client_id: &str, bytes: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = state.connections.get_mut(client_id) {
            conn.bytes_sent += bytes as u64;
            conn.last_activity = Instant::now();
        }
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .contains_key(client_id)
    }

    pub fn active_connections(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut connections: Vec<ConnectionSummary> = state
            .connections
            .values()
            .map(|c| ConnectionSummary {
                client_id: c.client_id.clone(),
                ip: c.ip,
                age_secs: now.duration_since(c.connected_at).as_secs(),
                idle_secs: now.duration_since(c.last_activity).as_secs(),
                message_count: c.message_count,
                bytes_received: c.bytes_received,
                bytes_sent: c.bytes_sent,
            })
            .collect();
        connections.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        ConnectionStats {
            active_connections: state.connections.len(),
            max_connections: self.config.max_connections,
            unique_ips: state.by_ip.len(),
            banned_ips: state.bans.values().filter(|until| now < **until).count(),
            total_messages: state.connections.values().map(|c| c.message_count).sum(),
            connections,
        }
    }

    /// Evict over-age and idle connections, clear expired bans.
    /// Returns the ids of evicted connections.
    pub fn evict_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let lifetime = Duration::from_secs(self.config.max_connection_lifetime_secs);
        let max_idle = Duration::from_secs(self.config.max_idle_secs);

        let (evicted, active) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<(String, &'static str)> = state
                .connections
                .values()
                .filter_map(|c| {
                    if now.duration_since(c.connected_at) >= lifetime {
                        Some((c.client_id.clone(), "lifetime"))
                    } else if now.duration_since(c.last_activity) >= max_idle {
                        Some((c.client_id.clone(), "idle"))
                    } else {
                        None
                    }
                })
                .collect();
            for (client_id, _) in &stale {
                remove_connection(&mut state, client_id);
            }
            state.bans.retain(|_, until| now < *until);
            (stale, state.connections.len())
        };

        if !evicted.is_empty() {
            metrics::set_active_connections(active);
        }
        for (client_id, reason) in &evicted {
            self.audit.log_security_event(
                SecurityEventType::ConnectionEvicted,
                Severity::Info,
                format!("Channel connection '{}' evicted ({})", client_id, reason),
                json!({ "client_id": client_id, "reason": reason }),
            );
        }
        evicted.into_iter().map(|(client_id, _)| client_id).collect()
    }

    pub fn sweep(&self) -> usize {
        self.evict_stale().len()
    }
}

fn remove_connection(state: &mut GovernorState, client_id: &str) -> Option<ConnectionMetrics> {
    let removed = state.connections.remove(client_id)?;
    if let Some(set) = state.by_ip.get_mut(&removed.ip) {
        set.remove(client_id);
        if set.is_empty() {
            state.by_ip.remove(&removed.ip);
        }
    }
    Some(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn governor(config: ChannelConfig) -> (ConnectionGovernor, AuditSink) {
        let audit = AuditSink::new(64, false);
        (ConnectionGovernor::new(config, audit.clone()), audit)
    }

    #[tokio::test(start_paused = true)]
    async fn per_ip_cap_rejects_and_bans() {
        let (gov, audit) = governor(ChannelConfig {
            max_connections_per_ip: 2,
            ip_ban_secs: 300,
            ..ChannelConfig::default()
        });
        gov.register_connection("a", ip(1)).unwrap();
        gov.register_connection("b", ip(1)).unwrap();

        let err = gov.validate_new_connection("c", ip(1)).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::IpLimit);
        assert_eq!(audit.count(SecurityEventType::ConnectionRejected), 1);

        // Banned even after a slot frees up.
        gov.unregister_connection("a");
        let err = gov.validate_new_connection("c", ip(1)).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::IpBanned);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(gov.validate_new_connection("c", ip(1)).is_ok());
        assert!(gov.validate_new_connection("d", ip(2)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_is_enforced() {
        let (gov, _) = governor(ChannelConfig {
            max_connections: 2,
            ..ChannelConfig::default()
        });
        gov.register_connection("a", ip(1)).unwrap();
        gov.register_connection("b", ip(2)).unwrap();
        let err = gov.register_connection("c", ip(3)).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::ConnectionLimit);
        assert_eq!(gov.active_connections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_is_rejected() {
        let (gov, _) = governor(ChannelConfig::default());
        gov.register_connection("a", ip(1)).unwrap();
        let err = gov.register_connection("a", ip(1)).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::DuplicateConnection);
    }

    #[tokio::test(start_paused = true)]
    async fn message_size_and_unknown_client() {
        let (gov, audit) = governor(ChannelConfig {
            max_message_size: 16,
            ..ChannelConfig::default()
        });
        let err = gov.validate_message("ghost", 1).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::UnknownConnection);

        gov.register_connection("a", ip(1)).unwrap();
        assert!(gov.validate_message("a", 16).is_ok());
        let err = gov.validate_message("a", 17).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::MessageTooLarge);
        assert_eq!(audit.count(SecurityEventType::MessageRejected), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_rate_window() {
        let (gov, _) = governor(ChannelConfig {
            max_messages_per_minute: 3,
            ..ChannelConfig::default()
        });
        gov.register_connection("a", ip(1)).unwrap();
        for _ in 0..3 {
            gov.validate_message("a", 10).unwrap();
        }
        let err = gov.validate_message("a", 10).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::MessageRate);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(gov.validate_message("a", 10).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_message_budget() {
        let (gov, _) = governor(ChannelConfig {
            max_messages_per_connection: 2,
            ..ChannelConfig::default()
        });
        gov.register_connection("a", ip(1)).unwrap();
        gov.validate_message("a", 1).unwrap();
        gov.validate_message("a", 1).unwrap();
        let err = gov.validate_message("a", 1).unwrap_err();
        assert_eq!(err.kind(), ResourceErrorKind::MessageLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_traffic() {
        let (gov, _) = governor(ChannelConfig::default());
        gov.register_connection("a", ip(1)).unwrap();
        gov.register_connection("b", ip(1)).unwrap();
        gov.validate_message("a", 100).unwrap();
        gov.record_sent("a", 40);

        let stats = gov.stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.unique_ips, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.connections[0].bytes_received, 100);
        assert_eq!(stats.connections[0].bytes_sent, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_and_old_connections() {
        let (gov, audit) = governor(ChannelConfig {
            max_idle_secs: 30,
            max_connection_lifetime_secs: 100,
            ..ChannelConfig::default()
        });
        gov.register_connection("idle", ip(1)).unwrap();
        gov.register_connection("busy", ip(2)).unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            gov.validate_message("busy", 1).unwrap();
            let evicted = gov.evict_stale();
            if !evicted.is_empty() {
                assert_eq!(evicted, vec!["idle".to_string()]);
            }
        }
        assert!(!gov.is_registered("idle"));
        assert!(gov.is_registered("busy"));

        tokio::time::advance(Duration::from_secs(20)).await;
        gov.validate_message("busy", 1).unwrap();
        assert_eq!(gov.sweep(), 1);
        assert_eq!(gov.stats().unique_ips, 0);
        assert_eq!(audit.count(SecurityEventType::ConnectionEvicted), 2);
    }
}
