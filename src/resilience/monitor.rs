//! Per-call resource monitor.
//!
//! Samples process CPU time and peak RSS while a governed call runs. Usage
//! is attributed as growth since the call started, so concurrent calls
//! share the process figures. Ceilings are reported, never enforced: the
//! wall-clock deadline is the governor's only hard stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::observability::audit::{AuditSink, SecurityEventType, Severity};

/// Process-wide resource figures at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    /// User + system CPU seconds.
    pub cpu_secs: f64,
    /// Peak resident set size in MiB.
    pub max_rss_mb: u64,
}

#[cfg(unix)]
pub fn sample_process() -> ResourceSample {
    // SAFETY: `rusage` is plain old data and getrusage only writes into it.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return ResourceSample::default();
        }
        usage
    };
    let cpu_secs = timeval_secs(usage.ru_utime) + timeval_secs(usage.ru_stime);

    // Linux reports KiB, macOS bytes.
    let max_rss = usage.ru_maxrss.max(0) as u64;
    let max_rss_mb = if cfg!(target_os = "macos") {
        max_rss / (1024 * 1024)
    } else {
        max_rss / 1024
    };

    ResourceSample {
        cpu_secs,
        max_rss_mb,
    }
}

#[cfg(unix)]
fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(not(unix))]
pub fn sample_process() -> ResourceSample {
    ResourceSample::default()
}

/// What a monitor watches and where it reports.
#[derive(Debug, Clone)]
pub(crate) struct MonitorSpec {
    pub operation_id: u64,
    pub op_type: String,
    pub interval: Duration,
    pub max_cpu_secs: f64,
    pub max_duration: Duration,
    /// Latest attributed memory growth, read by admission.
    pub memory_mb: Arc<AtomicU64>,
    pub audit: AuditSink,
}

/// Aborts the monitor task when dropped.
#[derive(Debug)]
pub(crate) struct MonitorGuard {
    task: JoinHandle<()>,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_monitor(spec: MonitorSpec) -> MonitorGuard {
    MonitorGuard {
        task: tokio::spawn(run(spec)),
    }
}

async fn run(spec: MonitorSpec) {
    let started = Instant::now();
    let baseline = sample_process();
    let mut ticker = time::interval_at(started + spec.interval, spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let sample = sample_process();
        let cpu_secs = (sample.cpu_secs - baseline.cpu_secs).max(0.0);
        let memory_mb = sample.max_rss_mb.saturating_sub(baseline.max_rss_mb);
        spec.memory_mb.store(memory_mb, Ordering::Relaxed);

        let elapsed = started.elapsed();
        let ceiling = if cpu_secs > spec.max_cpu_secs {
            Some("cpu")
        } else if elapsed > spec.max_duration {
            Some("duration")
        } else {
            None
        };

        if let Some(ceiling) = ceiling {
            tracing::warn!(
                operation_id = spec.operation_id,
                op_type = %spec.op_type,
                ceiling,
                cpu_secs,
                elapsed_ms = elapsed.as_millis() as u64,
                "Operation exceeded resource ceiling"
            );
            spec.audit.log_security_event(
                SecurityEventType::ResourceCeiling,
                Severity::Warning,
                format!("Operation {} exceeded its {} ceiling", spec.op_type, ceiling),
                json!({
                    "operation_id": spec.operation_id,
                    "op_type": spec.op_type,
                    "ceiling": ceiling,
                    "cpu_secs": cpu_secs,
                    "memory_mb": memory_mb,
                    "elapsed_ms": elapsed.as_millis() as u64,
                }),
            );
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn sampling_reports_usage() {
        let sample = sample_process();
        assert!(sample.cpu_secs >= 0.0);
        assert!(sample.max_rss_mb > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_ceiling_is_reported_once() {
        let audit = AuditSink::new(16, false);
        let guard = spawn_monitor(MonitorSpec {
            operation_id: 1,
            op_type: "lint".to_string(),
            interval: Duration::from_millis(100),
            max_cpu_secs: f64::MAX,
            max_duration: Duration::from_millis(250),
            memory_mb: Arc::new(AtomicU64::new(0)),
            audit: audit.clone(),
        });

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(audit.count(SecurityEventType::ResourceCeiling), 1);
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_guard_stops_sampling() {
        let audit = AuditSink::new(16, false);
        let guard = spawn_monitor(MonitorSpec {
            operation_id: 2,
            op_type: "test".to_string(),
            interval: Duration::from_millis(100),
            max_cpu_secs: f64::MAX,
            max_duration: Duration::from_millis(250),
            memory_mb: Arc::new(AtomicU64::new(0)),
            audit: audit.clone(),
        });
        drop(guard);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(audit.count(SecurityEventType::ResourceCeiling), 0);
    }
}
