//! Audio transport diagnostics.
//!
//! Counters are written by the sender worker and the codec notifications and
//! read by the controller's tick handler and the stats server. All fields are
//! atomics so readers never take a lock on the audio path.
//!
//! Counters are monotonic within a session and cleared by [`Diagnostics::reset`]
//! at session start. The lifetime free-datagram low-water mark and the uptime
//! origin survive resets.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "no low-water mark recorded yet".
const NO_MARK: usize = usize::MAX;

/// Shared diagnostics counters.
#[derive(Debug)]
pub struct Diagnostics {
    start_time: Instant,
    bytes_this_second: AtomicU64,
    bytes_per_second: AtomicU64,
    total_bytes: AtomicU64,
    total_datagrams: AtomicU64,
    total_sends: AtomicU64,
    send_failures: AtomicU64,
    sends_over_budget: AtomicU64,
    worst_send_us: AtomicU64,
    cumulative_send_us: AtomicU64,
    session_free_low_water: AtomicUsize,
    lifetime_free_low_water: AtomicUsize,
    overflow_active: AtomicBool,
    overflow_events: AtomicU64,
    overflow_dropped: AtomicU64,
    capture_faults: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub up_time_secs: u64,
    pub total_datagrams: u64,
    pub total_sends: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub send_failures: u64,
    pub worst_send_us: u64,
    pub average_send_us: u64,
    /// Share of sends slower than their block budget, in percent.
    pub percent_over_budget: f32,
    /// Fewest free datagram slots seen this session.
    pub min_free_datagrams: Option<usize>,
    /// Fewest free datagram slots seen since boot.
    pub lifetime_min_free_datagrams: Option<usize>,
    pub overflow_active: bool,
    pub overflow_events: u64,
    pub overflow_dropped: u64,
    pub capture_faults: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_this_second: AtomicU64::new(0),
            bytes_per_second: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_datagrams: AtomicU64::new(0),
            total_sends: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            sends_over_budget: AtomicU64::new(0),
            worst_send_us: AtomicU64::new(0),
            cumulative_send_us: AtomicU64::new(0),
            session_free_low_water: AtomicUsize::new(NO_MARK),
            lifetime_free_low_water: AtomicUsize::new(NO_MARK),
            overflow_active: AtomicBool::new(false),
            overflow_events: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            capture_faults: AtomicU64::new(0),
        }
    }

    /// Clear per-session counters. Lifetime low-water mark and uptime are kept.
    pub fn reset(&self) {
        self.bytes_this_second.store(0, Ordering::Relaxed);
        self.bytes_per_second.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.total_datagrams.store(0, Ordering::Relaxed);
        self.total_sends.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
        self.sends_over_budget.store(0, Ordering::Relaxed);
        self.worst_send_us.store(0, Ordering::Relaxed);
        self.cumulative_send_us.store(0, Ordering::Relaxed);
        self.session_free_low_water.store(NO_MARK, Ordering::Relaxed);
        self.overflow_active.store(false, Ordering::Relaxed);
        self.overflow_events.store(0, Ordering::Relaxed);
        self.overflow_dropped.store(0, Ordering::Relaxed);
        self.capture_faults.store(0, Ordering::Relaxed);
    }

    /// Record one successful network send carrying `datagrams` datagrams.
    ///
    /// The send is over budget when it took longer than `datagrams` block
    /// periods.
    pub fn record_send(
        &self,
        bytes: usize,
        datagrams: usize,
        duration: Duration,
        block_budget: Duration,
    ) {
        let us = duration.as_micros() as u64;
        self.bytes_this_second
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_datagrams
            .fetch_add(datagrams as u64, Ordering::Relaxed);
        self.total_sends.fetch_add(1, Ordering::Relaxed);
        self.cumulative_send_us.fetch_add(us, Ordering::Relaxed);
        self.worst_send_us.fetch_max(us, Ordering::Relaxed);

        let budget = block_budget.saturating_mul(datagrams.max(1) as u32);
        if duration > budget {
            self.sends_over_budget.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one failed (dropped) send.
    pub fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the codec's current free datagram count.
    pub fn record_free_datagrams(&self, free: usize) {
        self.session_free_low_water
            .fetch_min(free, Ordering::Relaxed);
        self.lifetime_free_low_water
            .fetch_min(free, Ordering::Relaxed);
    }

    /// Codec store started overflowing.
    pub fn record_overflow_begin(&self) {
        self.overflow_active.store(true, Ordering::Relaxed);
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Codec store recovered after dropping `dropped` datagrams.
    pub fn record_overflow_end(&self, dropped: u32) {
        self.overflow_active.store(false, Ordering::Relaxed);
        self.overflow_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Capture interrupt delivered an unexpected event mask.
    pub fn record_capture_fault(&self) {
        self.capture_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Move this second's byte count into the per-second rate.
    pub fn roll_second(&self) {
        let bytes = self.bytes_this_second.swap(0, Ordering::Relaxed);
        self.bytes_per_second.store(bytes, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn total_datagrams(&self) -> u64 {
        self.total_datagrams.load(Ordering::Relaxed)
    }

    /// Read all counters without modifying them.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let total_sends = self.total_sends.load(Ordering::Relaxed);
        let cumulative = self.cumulative_send_us.load(Ordering::Relaxed);
        let over_budget = self.sends_over_budget.load(Ordering::Relaxed);

        let (average_send_us, percent_over_budget) = if total_sends == 0 {
            (0, 0.0)
        } else {
            (
                cumulative / total_sends,
                (over_budget as f64 * 100.0 / total_sends as f64) as f32,
            )
        };

        let mark = |value: usize| (value != NO_MARK).then_some(value);

        DiagnosticsSnapshot {
            up_time_secs: self.uptime().as_secs(),
            total_datagrams: self.total_datagrams.load(Ordering::Relaxed),
            total_sends,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            bytes_per_second: self.bytes_per_second.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            worst_send_us: self.worst_send_us.load(Ordering::Relaxed),
            average_send_us,
            percent_over_budget,
            min_free_datagrams: mark(self.session_free_low_water.load(Ordering::Relaxed)),
            lifetime_min_free_datagrams: mark(
                self.lifetime_free_low_water.load(Ordering::Relaxed),
            ),
            overflow_active: self.overflow_active.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            capture_faults: self.capture_faults.load(Ordering::Relaxed),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
