/**
 * GATEWAY STATUS - Runtime counters and periodic summary
 *
 * ROLE: Shared, lock-light counters updated by intake and dispatcher; a
 * background task logs them as one JSON line at a fixed interval.
 */

use crate::buffer::CommandBuffer;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Executing,
    Waiting,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: String,
    pub uptime_seconds: u64,
    pub phase: DispatchPhase,
    pub queued: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub commands_ok: u64,
    pub commands_failed: u64,
    pub probes_ok: u64,
    pub probes_failed: u64,
    pub in_flight: u32,
    pub peak_in_flight: u32,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    commands_ok: AtomicU64,
    commands_failed: AtomicU64,
    probes_ok: AtomicU64,
    probes_failed: AtomicU64,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct GatewayStatus {
    start_time: Instant,
    counters: Arc<Counters>,
    phase: Arc<Mutex<DispatchPhase>>,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            phase: Arc::new(Mutex::new(DispatchPhase::Idle)),
        }
    }

    pub fn record_submitted(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, ok: bool) {
        let counter = if ok { &self.counters.commands_ok } else { &self.counters.commands_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self, ok: bool) {
        let counter = if ok { &self.counters.probes_ok } else { &self.counters.probes_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn begin_exchange(&self) {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub fn end_exchange(&self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_phase(&self, phase: DispatchPhase) {
        *self.phase.lock() = phase;
    }

    pub fn phase(&self) -> DispatchPhase {
        *self.phase.lock()
    }

    pub fn peak_in_flight(&self) -> u32 {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn report(&self, queued: usize) -> StatusReport {
        let c = &self.counters;
        StatusReport {
            generated_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            phase: self.phase(),
            queued,
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            commands_ok: c.commands_ok.load(Ordering::Relaxed),
            commands_failed: c.commands_failed.load(Ordering::Relaxed),
            probes_ok: c.probes_ok.load(Ordering::Relaxed),
            probes_failed: c.probes_failed.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight(),
        }
    }

    /// Logs a JSON summary every `every`; zero disables the reporter
    pub fn spawn_reporter(&self, buffer: Arc<CommandBuffer>, every: Duration) -> Option<JoinHandle<()>> {
        if every.is_zero() {
            return None;
        }
        let status = self.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                interval.tick().await;
                match serde_json::to_string(&status.report(buffer.len())) {
                    Ok(summary) => info!(target: "status", %summary, "gateway status"),
                    Err(e) => warn!(target: "status", error = %e, "failed to serialize status"),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_maximum() {
        let status = GatewayStatus::new();
        status.begin_exchange();
        status.end_exchange();
        status.begin_exchange();
        assert_eq!(status.peak_in_flight(), 1);
        status.end_exchange();

        let report = status.report(0);
        assert_eq!(report.in_flight, 0);
        assert_eq!(report.peak_in_flight, 1);
    }

    #[test]
    fn test_report_serializes() {
        let status = GatewayStatus::new();
        status.record_submitted();
        status.record_probe(false);
        status.set_phase(DispatchPhase::Waiting);

        let json = serde_json::to_value(status.report(4)).unwrap();
        assert_eq!(json["phase"], "waiting");
        assert_eq!(json["queued"], 4);
        assert_eq!(json["submitted"], 1);
        assert_eq!(json["probes_failed"], 1);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_reporter() {
        let status = GatewayStatus::new();
        let buffer = Arc::new(CommandBuffer::new(None));
        assert!(status.spawn_reporter(buffer, Duration::ZERO).is_none());
    }
}
