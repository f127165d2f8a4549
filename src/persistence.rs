//! Retained state in ESP32 RTC slow memory.
//!
//! RTC slow memory stays powered through deep sleep, so the record written
//! just before a halt is still there when the chip resets on wake. The
//! region is not initialised at boot; after a power-on it holds garbage,
//! which the record's magic word and checksum reject.
//!
//! # Usage
//!
//! ```ignore
//! use iot_audio_node::persistence::RtcRetainedStore;
//! use iot_audio_node::state::RetainedStore;
//!
//! let store = RtcRetainedStore::take().expect("store already taken");
//! let state = store.load();
//! ```

use crate::state::{RetainedStore, StateError, RECORD_LEN};
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{AtomicBool, Ordering};

// `.rtc_noinit` is what `RTC_NOINIT_ATTR` uses; the linker script keeps it in
// RTC slow memory and skips it at startup.
#[link_section = ".rtc_noinit"]
static mut REGION: [u8; RECORD_LEN] = [0; RECORD_LEN];

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Sole owner of the RTC retained region.
pub struct RtcRetainedStore {
    _private: (),
}

impl RtcRetainedStore {
    /// Claim the region. Returns `None` if it is already claimed.
    pub fn take() -> Option<Self> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self { _private: () })
    }
}

impl RetainedStore for RtcRetainedStore {
    fn read_raw(&self) -> Result<Option<Vec<u8>>, StateError> {
        // SAFETY: `take` hands out at most one store, and the store is the
        // only code touching REGION.
        let bytes = unsafe { (*addr_of!(REGION)).to_vec() };
        Ok(Some(bytes))
    }

    fn write_raw(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StateError> {
        // SAFETY: as above; `&mut self` excludes concurrent reads.
        unsafe { (*addr_of_mut!(REGION)).copy_from_slice(record) };
        Ok(())
    }
}

impl Drop for RtcRetainedStore {
    fn drop(&mut self) {
        TAKEN.store(false, Ordering::Release);
    }
}
