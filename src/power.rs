//! Power and liveness driver interface.
//!
//! Battery gauge, charger and watchdog registers are outside the core; the
//! controller only needs the three operations of [`PowerControl`].

use crate::clock::SimulatedRtc;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "esp32")]
pub use esp::EspPower;

/// Power/liveness operations used by the duty-cycle controller.
pub trait PowerControl: Send + Sync {
    /// Whether the node is running from external power (charger/USB).
    fn is_external_power_present(&self) -> bool;

    /// Service the liveness watchdog.
    fn feed_liveness(&self);

    /// Halt in the lowest power state for `duration_secs`; `0` means no
    /// timed wake-up (power cycle or watchdog only).
    ///
    /// On hardware this does not return: execution resumes at boot. Host
    /// implementations return so the caller can simulate the reset.
    fn enter_low_power(&self, duration_secs: u32);
}

/// Host stand-in for the power driver.
///
/// Low-power halts advance a [`SimulatedRtc`] instead of stopping the CPU.
pub struct SimulatedPower {
    external_power: AtomicBool,
    liveness_feeds: AtomicU64,
    halts: Mutex<Vec<u32>>,
    rtc: Arc<SimulatedRtc>,
    halt_pause: Duration,
}

impl SimulatedPower {
    /// Create a simulated driver.
    ///
    /// `halt_pause` is real time spent inside each halt so a host node does
    /// not spin through reboot cycles.
    pub fn new(rtc: Arc<SimulatedRtc>, external_power: bool, halt_pause: Duration) -> Self {
        Self {
            external_power: AtomicBool::new(external_power),
            liveness_feeds: AtomicU64::new(0),
            halts: Mutex::new(Vec::new()),
            rtc,
            halt_pause,
        }
    }

    /// Plug or unplug external power.
    pub fn set_external_power(&self, present: bool) {
        self.external_power.store(present, Ordering::Relaxed);
    }

    /// Number of liveness feeds so far.
    pub fn liveness_feeds(&self) -> u64 {
        self.liveness_feeds.load(Ordering::Relaxed)
    }

    /// Durations of every halt so far.
    pub fn halts(&self) -> Vec<u32> {
        self.halts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PowerControl for SimulatedPower {
    fn is_external_power_present(&self) -> bool {
        self.external_power.load(Ordering::Relaxed)
    }

    fn feed_liveness(&self) {
        self.liveness_feeds.fetch_add(1, Ordering::Relaxed);
    }

    fn enter_low_power(&self, duration_secs: u32) {
        info!("Simulated low-power halt for {}s", duration_secs);
        self.halts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration_secs);
        if !self.halt_pause.is_zero() {
            std::thread::sleep(self.halt_pause);
        }
        self.rtc.advance(duration_secs as u64);
    }
}

#[cfg(feature = "esp32")]
mod esp {
    use super::PowerControl;
    use esp_idf_sys::{
        esp_deep_sleep_start, esp_sleep_enable_timer_wakeup, esp_task_wdt_reset, gpio_get_level,
        gpio_mode_t_GPIO_MODE_INPUT, gpio_num_t, gpio_set_direction,
    };

    /// ESP32 power driver: VBUS sense pin, task watchdog, deep sleep.
    pub struct EspPower {
        vbus_pin: gpio_num_t,
    }

    impl EspPower {
        /// `vbus_pin` reads high while external power is connected.
        pub fn new(vbus_pin: gpio_num_t) -> Self {
            // SAFETY: configuring a GPIO direction has no memory-safety preconditions.
            unsafe {
                gpio_set_direction(vbus_pin, gpio_mode_t_GPIO_MODE_INPUT);
            }
            Self { vbus_pin }
        }
    }

    impl PowerControl for EspPower {
        fn is_external_power_present(&self) -> bool {
            // SAFETY: pin was configured as input in `new`.
            unsafe { gpio_get_level(self.vbus_pin) != 0 }
        }

        fn feed_liveness(&self) {
            // SAFETY: resets the calling task's watchdog entry.
            unsafe {
                esp_task_wdt_reset();
            }
        }

        fn enter_low_power(&self, duration_secs: u32) {
            log::info!("Entering deep sleep for {}s", duration_secs);
            // SAFETY: deep sleep never returns; RTC memory keeps the retained record.
            unsafe {
                if duration_secs > 0 {
                    esp_sleep_enable_timer_wakeup(duration_secs as u64 * 1_000_000);
                }
                esp_deep_sleep_start();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Rtc;

    #[test]
    fn test_simulated_halt_advances_rtc() {
        let rtc = SimulatedRtc::new();
        let power = SimulatedPower::new(rtc.clone(), false, Duration::ZERO);
        let before = rtc.now_secs();
        power.enter_low_power(600);
        assert!(rtc.now_secs() >= before + 600);
        assert_eq!(power.halts(), vec![600]);
    }

    #[test]
    fn test_external_power_toggle() {
        let power = SimulatedPower::new(SimulatedRtc::new(), false, Duration::ZERO);
        assert!(!power.is_external_power_present());
        power.set_external_power(true);
        assert!(power.is_external_power_present());
    }

    #[test]
    fn test_liveness_counter() {
        let power = SimulatedPower::new(SimulatedRtc::new(), true, Duration::ZERO);
        power.feed_liveness();
        power.feed_liveness();
        assert_eq!(power.liveness_feeds(), 2);
    }
}
