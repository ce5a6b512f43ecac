//! Security audit sink.
//!
//! Every guard decision that matters to an operator is reported here exactly
//! once: to `tracing` (target `security_audit`), to an in-memory ring of recent
//! events, and optionally to a JSON-lines file written by a background task.
//!
//! The sink is the only process-wide handle in the crate ([`global`]). Guards
//! accept an explicit [`AuditSink`] so tests can observe their own events.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Severity attached to a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    CommandExecuted,
    CommandFailed,
    CommandTimeout,
    CommandError,
    CommandBlocked,
    PathViolation,
    FileWritten,
    FileWriteFailed,
    AuthSuccess,
    AuthFailure,
    AuthExpired,
    AccessDenied,
    ApiKeyChanged,
    ClientBlocked,
    OperationRejected,
    OperationTimeout,
    ResourceCeiling,
    CircuitOpened,
    CircuitClosed,
    ConnectionRejected,
    MessageRejected,
    ConnectionEvicted,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandExecuted => "command_executed",
            Self::CommandFailed => "command_failed",
            Self::CommandTimeout => "command_timeout",
            Self::CommandError => "command_error",
            Self::CommandBlocked => "command_blocked",
            Self::PathViolation => "path_violation",
            Self::FileWritten => "file_written",
            Self::FileWriteFailed => "file_write_failed",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::AuthExpired => "auth_expired",
            Self::AccessDenied => "access_denied",
            Self::ApiKeyChanged => "api_key_changed",
            Self::ClientBlocked => "client_blocked",
            Self::OperationRejected => "operation_rejected",
            Self::OperationTimeout => "operation_timeout",
            Self::ResourceCeiling => "resource_ceiling",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::ConnectionRejected => "connection_rejected",
            Self::MessageRejected => "message_rejected",
            Self::ConnectionEvicted => "connection_evicted",
        }
    }
}

impl std::fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit record.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub message: String,
    pub context: Map<String, Value>,
}

struct SinkInner {
    verbose: bool,
    capacity: usize,
    recent: Mutex<VecDeque<SecurityEvent>>,
    writer: Option<mpsc::UnboundedSender<SecurityEvent>>,
}

/// Handle to the audit sink. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("verbose", &self.inner.verbose)
            .field("capacity", &self.inner.capacity)
            .field("file", &self.inner.writer.is_some())
            .finish()
    }
}

/// Background task that appends audit events to a file.
pub struct AuditWriterTask {
    rx: mpsc::UnboundedReceiver<SecurityEvent>,
    file: File,
}

impl AuditWriterTask {
    /// Run until every sink handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            let line = format!("{json}\n");
            if let Ok(mut file) = self.file.try_clone() {
                let _ = tokio::task::spawn_blocking(move || {
                    if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                        tracing::warn!(error = %e, "Failed to write audit event to file");
                    }
                })
                .await;
            }
        }
    }
}

impl AuditSink {
    /// In-memory sink keeping the last `capacity` events.
    pub fn new(capacity: usize, verbose: bool) -> Self {
        Self::build(capacity, verbose, None)
    }

    /// Sink that also appends JSON lines to `path`.
    ///
    /// Returns the writer task, which the caller must spawn.
    pub fn with_file(
        path: &Path,
        capacity: usize,
        verbose: bool,
    ) -> std::io::Result<(Self, AuditWriterTask)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self::build(capacity, verbose, Some(tx)), AuditWriterTask { rx, file }))
    }

    fn build(
        capacity: usize,
        verbose: bool,
        writer: Option<mpsc::UnboundedSender<SecurityEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                verbose,
                capacity: capacity.max(1),
                recent: Mutex::new(VecDeque::new()),
                writer,
            }),
        }
    }

    /// Record a security event.
    ///
    /// `context` should be a JSON object; any other value is stored under `"value"`.
    pub fn log_security_event(
        &self,
        event_type: SecurityEventType,
        severity: Severity,
        message: impl Into<String>,
        context: Value,
    ) {
        let context = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let event = SecurityEvent {
            timestamp_ms: now_millis(),
            event_type,
            severity,
            message: message.into(),
            context,
        };

        self.emit_tracing(&event);

        if let Some(writer) = &self.inner.writer {
            let _ = writer.send(event.clone());
        }

        let mut recent = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.inner.capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    fn emit_tracing(&self, event: &SecurityEvent) {
        let context = Value::Object(event.context.clone());
        match event.severity {
            Severity::Info if self.inner.verbose => tracing::info!(
                target: "security_audit",
                event_type = %event.event_type,
                context = %context,
                "{}", event.message
            ),
            Severity::Info => tracing::debug!(
                target: "security_audit",
                event_type = %event.event_type,
                context = %context,
                "{}", event.message
            ),
            Severity::Warning => tracing::warn!(
                target: "security_audit",
                event_type = %event.event_type,
                context = %context,
                "{}", event.message
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                target: "security_audit",
                event_type = %event.event_type,
                severity = ?event.severity,
                context = %context,
                "{}", event.message
            ),
        }
    }

    /// Snapshot of the most recent events, oldest first.
    pub fn recent(&self) -> Vec<SecurityEvent> {
        self.inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained events of the given type.
    pub fn count(&self, event_type: SecurityEventType) -> usize {
        self.inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn is_verbose(&self) -> bool {
        self.inner.verbose
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new(256, false)
    }
}

static GLOBAL_SINK: OnceLock<AuditSink> = OnceLock::new();

/// Install the process-wide sink. Returns `false` if one was already set.
pub fn install(sink: AuditSink) -> bool {
    GLOBAL_SINK.set(sink).is_ok()
}

/// The process-wide sink, created with defaults on first use.
pub fn global() -> AuditSink {
    GLOBAL_SINK.get_or_init(AuditSink::default).clone()
}

/// Record an event on the process-wide sink.
pub fn log_security_event(
    event_type: SecurityEventType,
    severity: Severity,
    message: impl Into<String>,
    context: Value,
) {
    global().log_security_event(event_type, severity, message, context);
}

/// Length-bounded preview of a sensitive value.
pub fn preview(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
