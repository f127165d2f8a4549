//! Time sources.
//!
//! Two clocks with different jobs:
//! - [`MonotonicClock`]: microsecond timing of sends on the audio path
//! - [`Rtc`]: wall-clock seconds stamped into the retained sleep window

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic microsecond clock.
pub trait MonotonicClock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin.
    fn now_us(&self) -> u64;
}

/// Real-time clock in unix seconds.
pub trait Rtc: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Monotonic clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Wall clock from [`SystemTime`]. On ESP32 the RTC timer keeps it running
/// through deep sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRtc;

impl Rtc for SystemRtc {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// System time plus an offset that simulated deep sleeps advance.
///
/// On host builds the device does not really halt, so entering low power
/// moves this clock forward by the sleep duration instead.
#[derive(Debug, Default)]
pub struct SimulatedRtc {
    offset_secs: AtomicU64,
}

impl SimulatedRtc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Jump forward, as if the device had slept.
    pub fn advance(&self, secs: u64) {
        self.offset_secs.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Rtc for SimulatedRtc {
    fn now_secs(&self) -> u64 {
        SystemRtc.now_secs() + self.offset_secs.load(Ordering::Relaxed)
    }
}

/// Manually advanced clock for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set_secs(&self, secs: u64) {
        self.now_us.store(secs * 1_000_000, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl MonotonicClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Rtc for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst) / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clock.now_us() > a);
    }

    #[test]
    fn test_simulated_rtc_advance() {
        let rtc = SimulatedRtc::new();
        let before = rtc.now_secs();
        rtc.advance(3600);
        assert!(rtc.now_secs() >= before + 3600);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        clock.advance_us(1500);
        assert_eq!(MonotonicClock::now_us(&*clock), 1500);
        clock.set_secs(10);
        assert_eq!(Rtc::now_secs(&*clock), 10);
    }
}
