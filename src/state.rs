//! # Host State Management
//!
//! Counters shared by everything that runs sessions. The host loop serves one
//! session at a time, but the signal handler and the session futures still
//! look at this state concurrently, so it lives behind a lock.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: the host loop and whoever logs the summary both hold a handle
//! - **RwLock**: snapshots read, session reports write
//! - **Clone**: cloning `HostState` clones the handle, not the counters

use crate::session::SessionReport;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::info;

/// Shared host counters.
#[derive(Debug, Clone)]
pub struct HostState {
    pub metrics: Arc<RwLock<HostMetrics>>,

    /// When the host started (never changes)
    pub start_time: Instant,
}

/// Totals across every session served by this process.
#[derive(Debug, Default, Clone, Serialize)]
pub struct HostMetrics {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_aborted: u64,
    pub sessions_failed: u64,
    /// Requests refused before an engine was started
    pub requests_rejected: u64,
    /// PCM bytes sent to the channel
    pub bytes_relayed: u64,
    /// PCM bytes that entered a ring buffer
    pub bytes_buffered: u64,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HostMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn record_started(&self) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.sessions_started += 1;
        }
    }

    pub fn record_rejected(&self) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.requests_rejected += 1;
        }
    }

    /// Fold a finished session's report into the totals.
    pub fn record_finished(&self, report: &SessionReport) {
        if let Ok(mut metrics) = self.metrics.write() {
            match report.status.as_str() {
                "completed" => metrics.sessions_completed += 1,
                "aborted" => metrics.sessions_aborted += 1,
                "failed" => metrics.sessions_failed += 1,
                _ => {}
            }
            metrics.bytes_relayed += report.bytes_out;
            metrics.bytes_buffered += report.bytes_in;
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> HostMetrics {
        self.metrics
            .read()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn log_summary(&self) {
        let metrics = self.snapshot();
        info!(
            uptime_s = self.uptime_seconds(),
            started = metrics.sessions_started,
            completed = metrics.sessions_completed,
            aborted = metrics.sessions_aborted,
            failed = metrics.sessions_failed,
            rejected = metrics.requests_rejected,
            bytes_relayed = metrics.bytes_relayed,
            "Host summary"
        );
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}
