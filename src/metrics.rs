//! Runtime metrics
//!
//! Counters are kept twice: in process-local atomics so the HTTP surface can report a snapshot
//! without an exporter, and through the `metrics` facade for whatever recorder the binary installs.

use metrics::{counter, histogram};
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Counters {
    scans_started: AtomicU64,
    scans_completed: AtomicU64,
    scans_failed: AtomicU64,
    hosts_profiled: AtomicU64,
    hosts_skipped: AtomicU64,
    vulnerabilities_found: AtomicU64,
    rpc_calls: AtomicU64,
    rpc_errors: AtomicU64,
    console_timeouts: AtomicU64,
    captures_started: AtomicU64,
}

/// Shared collector handed to every component that reports activity
#[derive(Debug)]
pub struct MetricsCollector {
    start_time: Instant,
    counters: Counters,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Counters::default(),
        }
    }

    pub fn record_scan_started(&self, kind: &'static str) {
        self.counters.scans_started.fetch_add(1, Ordering::Relaxed);
        counter!("scans_started_total", 1, "kind" => kind);
    }

    pub fn record_scan_completed(&self, kind: &'static str, duration: Duration) {
        self.counters.scans_completed.fetch_add(1, Ordering::Relaxed);
        counter!("scans_completed_total", 1, "kind" => kind);
        histogram!("scan_duration_seconds", duration.as_secs_f64(), "kind" => kind);
    }

    pub fn record_scan_failed(&self, kind: &'static str) {
        self.counters.scans_failed.fetch_add(1, Ordering::Relaxed);
        counter!("scans_failed_total", 1, "kind" => kind);
    }

    pub fn record_host_profiled(&self, open_ports: usize) {
        self.counters.hosts_profiled.fetch_add(1, Ordering::Relaxed);
        counter!("hosts_profiled_total", 1);
        counter!("open_ports_found_total", open_ports as u64);
    }

    /// A host dropped from a batch, either unreachable or failed while profiling
    pub fn record_host_skipped(&self, reason: &'static str) {
        self.counters.hosts_skipped.fetch_add(1, Ordering::Relaxed);
        counter!("hosts_skipped_total", 1, "reason" => reason);
    }

    pub fn record_vulnerabilities(&self, count: usize) {
        self.counters
            .vulnerabilities_found
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("vulnerabilities_found_total", count as u64);
    }

    pub fn record_rpc_call(&self, method: &str, duration: Duration, success: bool) {
        self.counters.rpc_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.counters.rpc_errors.fetch_add(1, Ordering::Relaxed);
        }
        let method = method.to_string();
        counter!("rpc_calls_total", 1, "method" => method.clone(), "success" => success.to_string());
        histogram!("rpc_call_duration_seconds", duration.as_secs_f64(), "method" => method);
    }

    pub fn record_console_timeout(&self) {
        self.counters.console_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("console_timeouts_total", 1);
    }

    pub fn record_capture_started(&self) {
        self.counters.captures_started.fetch_add(1, Ordering::Relaxed);
        counter!("captures_started_total", 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            scans_started: c.scans_started.load(Ordering::Relaxed),
            scans_completed: c.scans_completed.load(Ordering::Relaxed),
            scans_failed: c.scans_failed.load(Ordering::Relaxed),
            hosts_profiled: c.hosts_profiled.load(Ordering::Relaxed),
            hosts_skipped: c.hosts_skipped.load(Ordering::Relaxed),
            vulnerabilities_found: c.vulnerabilities_found.load(Ordering::Relaxed),
            rpc_calls: c.rpc_calls.load(Ordering::Relaxed),
            rpc_errors: c.rpc_errors.load(Ordering::Relaxed),
            console_timeouts: c.console_timeouts.load(Ordering::Relaxed),
            captures_started: c.captures_started.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub scans_started: u64,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub hosts_profiled: u64,
    pub hosts_skipped: u64,
    pub vulnerabilities_found: u64,
    pub rpc_calls: u64,
    pub rpc_errors: u64,
    pub console_timeouts: u64,
    pub captures_started: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Uptime: {}s", self.uptime_secs)?;
        writeln!(
            f,
            "Scans: {} started, {} completed, {} failed",
            self.scans_started, self.scans_completed, self.scans_failed
        )?;
        writeln!(f, "Hosts: {} profiled, {} skipped", self.hosts_profiled, self.hosts_skipped)?;
        writeln!(f, "Vulnerabilities: {}", self.vulnerabilities_found)?;
        write!(
            f,
            "RPC: {} calls, {} errors, {} console timeouts",
            self.rpc_calls, self.rpc_errors, self.console_timeouts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let metrics = MetricsCollector::new();
        metrics.record_scan_started("network");
        metrics.record_host_profiled(3);
        metrics.record_host_skipped("unreachable");
        metrics.record_scan_completed("network", Duration::from_millis(20));
        metrics.record_rpc_call("console.read", Duration::from_millis(2), false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scans_started, 1);
        assert_eq!(snapshot.scans_completed, 1);
        assert_eq!(snapshot.hosts_profiled, 1);
        assert_eq!(snapshot.hosts_skipped, 1);
        assert_eq!(snapshot.rpc_calls, 1);
        assert_eq!(snapshot.rpc_errors, 1);
    }

    #[test]
    fn test_snapshot_display() {
        let text = MetricsCollector::new().snapshot().to_string();
        assert!(text.contains("Scans: 0 started"));
    }
}
