//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guards.
//! All types derive Serde traits for deserialization from config files.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::AccessLevel;

/// Root configuration for the guard context.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Subprocess execution limits.
    pub command: CommandConfig,

    /// Filesystem boundary limits.
    pub paths: PathConfig,

    /// Bounded operation governor settings.
    pub governor: GovernorConfig,

    /// Authenticator settings.
    pub auth: AuthConfig,

    /// Failure-based rate limiting per category.
    pub failure_limits: FailureLimitsConfig,

    /// Streaming channel connection/message limits.
    pub channel: ChannelConfig,

    /// Background sweep settings.
    pub maintenance: MaintenanceConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Management API settings.
    pub admin: AdminConfig,
}

/// Tunable limits for the command execution guard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Maximum total characters across all arguments.
    pub max_command_length: usize,

    /// Maximum characters in any single argument.
    pub max_arg_length: usize,

    /// Executables permitted to run. `None` allows anything not blocked.
    pub allowed_executables: Option<BTreeSet<String>>,

    /// Executables that are never run, regardless of the allow-set.
    pub blocked_executables: BTreeSet<String>,

    /// Timeout applied when the caller does not pass one.
    pub default_timeout_secs: f64,

    /// Upper bound for caller-supplied timeouts.
    pub max_timeout_secs: f64,

    /// Maximum number of environment variables passed to a child.
    pub max_env_vars: usize,

    /// Maximum length of a single environment value.
    pub max_env_value_length: usize,

    /// Enable working-directory validation.
    pub validate_cwd: bool,

    /// Optional directory every working directory must live under.
    pub cwd_base: Option<PathBuf>,

    /// Characters of the command kept in audit previews.
    pub preview_length: usize,
}

/// Name kept for callers that think of this section as the subprocess policy.
pub type SubprocessSecurityConfig = CommandConfig;

impl Default for CommandConfig {
    fn default() -> Self {
        let blocked = [
            "sudo", "su", "doas", "pkexec", "nc", "ncat", "netcat", "telnet", "dd", "mkfs",
            "shutdown", "reboot", "halt", "poweroff", "eval", "exec",
        ];
        Self {
            max_command_length: 32_768,
            max_arg_length: 8_192,
            allowed_executables: None,
            blocked_executables: blocked.iter().map(|s| s.to_string()).collect(),
            default_timeout_secs: 300.0,
            max_timeout_secs: 3600.0,
            max_env_vars: 256,
            max_env_value_length: 4_096,
            validate_cwd: true,
            cwd_base: None,
            preview_length: 200,
        }
    }
}

/// Filesystem boundary limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathConfig {
    /// Maximum accepted path length in bytes.
    pub max_path_length: usize,

    /// Maximum size of a file read for backup.
    pub max_file_size: u64,

    /// Characters of a path kept in audit previews.
    pub preview_length: usize,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            max_path_length: 4_096,
            max_file_size: 100 * 1024 * 1024, // 100MB
            preview_length: 200,
        }
    }
}

/// Ceilings for one governed operation class.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OperationLimits {
    /// Maximum concurrent in-flight calls of this type.
    pub max_concurrent: usize,

    /// Maximum calls per client in the trailing rate window.
    pub max_per_minute: usize,

    /// CPU time ceiling (reported, not enforced).
    pub max_cpu_secs: f64,

    /// Aggregate memory ceiling for in-flight calls.
    pub max_memory_mb: u64,

    /// Duration ceiling (reported, not enforced).
    pub max_duration_secs: u64,

    /// Wall-clock deadline for a single call.
    pub timeout_secs: u64,

    /// Consecutive failures that open the breaker.
    pub circuit_breaker_threshold: u32,

    /// Cooldown before an open breaker admits a probe.
    pub circuit_breaker_timeout_secs: u64,
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_per_minute: 60,
            max_cpu_secs: 30.0,
            max_memory_mb: 1024,
            max_duration_secs: 300,
            timeout_secs: 600,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
        }
    }
}

/// Bounded operation governor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Limits used for operation types without an explicit entry.
    pub defaults: OperationLimits,

    /// Per operation type overrides.
    pub operations: HashMap<String, OperationLimits>,

    /// Resource monitor sampling interval in milliseconds.
    pub monitor_interval_ms: u64,

    /// Finalized metrics records kept in history.
    pub history_capacity: usize,

    /// Trailing window for per-client admission counting.
    pub rate_window_secs: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            defaults: OperationLimits::default(),
            operations: HashMap::new(),
            monitor_interval_ms: 100,
            history_capacity: 1_000,
            rate_window_secs: 60,
        }
    }
}

impl GovernorConfig {
    /// Limits for an operation type, falling back to the defaults.
    pub fn limits_for(&self, op_type: &str) -> &OperationLimits {
        self.operations.get(op_type).unwrap_or(&self.defaults)
    }
}

/// Authenticator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for signed tokens and request signatures.
    /// Falls back to `TOOLGUARD_AUTH_SECRET`, then a random per-process secret.
    pub secret: Option<String>,

    /// Treat loopback callers as administrators.
    pub local_only: bool,

    /// Level granted to requests without credentials.
    pub default_access_level: AccessLevel,

    /// Allowed clock skew for HMAC request signatures.
    pub hmac_max_skew_secs: u64,

    /// Lifetime of tokens minted without an explicit TTL.
    pub default_token_ttl_secs: u64,

    /// Characters of an authorization header kept in audit previews.
    pub preview_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            local_only: true,
            default_access_level: AccessLevel::Public,
            hmac_max_skew_secs: 300,
            default_token_ttl_secs: 3_600,
            preview_length: 16,
        }
    }
}

/// Failure budget for one category.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct FailureLimit {
    /// Failures within the window that trigger a block.
    pub max_failures: usize,

    /// Sliding window length in seconds.
    pub window_secs: u64,

    /// Block length in seconds.
    pub block_secs: u64,
}

impl FailureLimit {
    pub const fn new(max_failures: usize, window_secs: u64, block_secs: u64) -> Self {
        Self {
            max_failures,
            window_secs,
            block_secs,
        }
    }
}

/// Failure-based rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailureLimitsConfig {
    /// Budget for categories without an explicit entry.
    pub default: FailureLimit,

    /// Stricter named categories. Entries from a config file are layered
    /// over the built-in ones.
    #[serde(deserialize_with = "merge_categories")]
    pub categories: BTreeMap<String, FailureLimit>,
}

fn merge_categories<'de, D>(deserializer: D) -> Result<BTreeMap<String, FailureLimit>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut categories = FailureLimitsConfig::default().categories;
    categories.extend(BTreeMap::<String, FailureLimit>::deserialize(deserializer)?);
    Ok(categories)
}

impl Default for FailureLimitsConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert("command_injection".to_string(), FailureLimit::new(3, 300, 1_800));
        categories.insert("path_traversal".to_string(), FailureLimit::new(5, 300, 900));
        categories.insert("authentication".to_string(), FailureLimit::new(5, 300, 600));
        Self {
            default: FailureLimit::new(10, 60, 300),
            categories,
        }
    }
}

impl FailureLimitsConfig {
    /// Budget for a category, falling back to the default.
    pub fn limit_for(&self, category: &str) -> FailureLimit {
        self.categories.get(category).copied().unwrap_or(self.default)
    }
}

/// Streaming channel limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Global connection cap.
    pub max_connections: usize,

    /// Connections allowed from one IP.
    pub max_connections_per_ip: usize,

    /// Cooldown ban applied to an IP that hits its cap.
    pub ip_ban_secs: u64,

    /// Largest accepted message in bytes.
    pub max_message_size: usize,

    /// Lifetime message cap per connection.
    pub max_messages_per_connection: u64,

    /// Rolling 60-second message cap per connection.
    pub max_messages_per_minute: usize,

    /// Connections older than this are evicted by the sweep.
    pub max_connection_lifetime_secs: u64,

    /// Connections idle longer than this are evicted by the sweep.
    pub max_idle_secs: u64,

    /// Sweep interval for the channel governor.
    pub cleanup_interval_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_ip: 10,
            ip_ban_secs: 300,
            max_message_size: 1024 * 1024, // 1MB
            max_messages_per_connection: 10_000,
            max_messages_per_minute: 120,
            max_connection_lifetime_secs: 3_600,
            max_idle_secs: 300,
            cleanup_interval_secs: 30,
        }
    }
}

/// Background sweep settings for the non-channel guards.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between sweeps in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Verbose security logging.
    pub debug: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Optional JSON-lines file receiving every security event.
    pub audit_log_path: Option<PathBuf>,

    /// Recent security events kept in memory.
    pub audit_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
            audit_log_path: None,
            audit_buffer: 256,
        }
    }
}

/// Management API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the management API and streaming channel.
    pub enabled: bool,

    /// Bind address. Loopback by default; no TLS is offered.
    pub bind_address: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
            request_timeout_secs: 30,
        }
    }
}
