//! Retained state surviving reset and deep sleep.
//!
//! The controller writes a [`PersistentState`] immediately before every sleep
//! transition and reads it once at boot. Backends only move a fixed-size byte
//! record; encoding, integrity checks and garbage handling live here so every
//! backend behaves the same.
//!
//! # Record layout (little-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic |
//! | 4 | 4 | history marker |
//! | 8 | 8 | sleep entered at (unix seconds) |
//! | 16 | 8 | wake at (unix seconds) |
//! | 24 | 4 | wake tick counter |
//! | 28 | 28 | pending duty-cycle timing |
//! | 56 | 8 | pending audio flags, gain, duration limit |
//! | 64 | 65 | pending server URL (length + bytes) |
//! | 132 | 4 | checksum |

use crate::config::{AudioConfig, DutyCycleConfig, Gain, ServerUrl, TransportMode, MAX_URL_LEN};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Size of the encoded record.
pub const RECORD_LEN: usize = 136;

const MAGIC: u32 = 0x4941_4E53;
const CHECKSUM_OFFSET: usize = RECORD_LEN - 4;

const MARKER_OFF: u32 = 0x0FF0_A55A;
const MARKER_STANDBY: u32 = 0x5B5B_A55A;
const MARKER_NORMAL: u32 = 0x6E6E_A55A;

/// What the device was doing before its last sleep or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMarker {
    /// Power-on reset or unreadable retained memory.
    #[default]
    Unknown,
    /// Halted until power cycle or watchdog.
    Off,
    /// Timed deep sleep; `sleep_window` is valid.
    Standby,
    /// Awake in a mode when the reset happened.
    Normal,
}

impl HistoryMarker {
    /// Raw retained value. Patterns are chosen so zeroed or random memory
    /// does not decode to a valid marker.
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Off => MARKER_OFF,
            Self::Standby => MARKER_STANDBY,
            Self::Normal => MARKER_NORMAL,
        }
    }

    /// Decode a raw retained value. Any unrecognised pattern is `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            MARKER_OFF => Self::Off,
            MARKER_STANDBY => Self::Standby,
            MARKER_NORMAL => Self::Normal,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HistoryMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Off => "off",
            Self::Standby => "standby",
            Self::Normal => "normal",
        };
        write!(f, "{}", name)
    }
}

/// Timed sleep interval in RTC seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SleepWindow {
    pub entered_at: u64,
    pub wake_at: u64,
}

/// Record kept in retained memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentState {
    pub history_marker: HistoryMarker,
    pub sleep_window: SleepWindow,
    pub wake_tick_counter: u32,
    /// Duty-cycle timing written remotely but not yet applied.
    pub pending_duty: DutyCycleConfig,
    /// Audio parameters written remotely.
    pub pending_audio: AudioConfig,
}

impl PersistentState {
    /// Sleep window, only when the marker says it is meaningful.
    pub fn standby_window(&self) -> Option<SleepWindow> {
        match self.history_marker {
            HistoryMarker::Standby => Some(self.sleep_window),
            _ => None,
        }
    }

    /// Encode into the fixed retained record.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        put_u32(&mut buf, 0, MAGIC);
        put_u32(&mut buf, 4, self.history_marker.to_raw());
        put_u64(&mut buf, 8, self.sleep_window.entered_at);
        put_u64(&mut buf, 16, self.sleep_window.wake_at);
        put_u32(&mut buf, 24, self.wake_tick_counter);

        let duty = &self.pending_duty;
        put_u32(&mut buf, 28, duty.init_tick_period_secs);
        put_u32(&mut buf, 32, duty.init_tick_modulo);
        put_u32(&mut buf, 36, duty.ready_tick_period1_secs);
        put_u32(&mut buf, 40, duty.ready_tick_period2_secs);
        put_u32(&mut buf, 44, duty.ready_tick_modulo);
        put_u64(&mut buf, 48, duty.max_sleep_chunk_ms);

        let audio = &self.pending_audio;
        buf[56] = audio.streaming_enabled as u8;
        buf[57] = audio.transport_mode.to_byte();
        match audio.gain {
            Gain::Auto => {
                buf[58] = 0;
                buf[59] = 0;
            }
            Gain::Fixed(db) => {
                buf[58] = 1;
                buf[59] = db as u8;
            }
        }
        put_u32(&mut buf, 60, audio.duration_limit_secs.unwrap_or(0));

        let url = audio.server_url.address();
        let url = url.as_bytes();
        let len = url.len().min(MAX_URL_LEN);
        buf[64] = len as u8;
        buf[65..65 + len].copy_from_slice(&url[..len]);

        let sum = checksum(&buf[..CHECKSUM_OFFSET]);
        put_u32(&mut buf, CHECKSUM_OFFSET, sum);
        buf
    }

    /// Decode a retained record.
    ///
    /// A record with a bad magic word, length or checksum is rejected.
    /// Within a valid record, unusable pending values fall back to defaults
    /// field group by field group.
    pub fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        if bytes.len() != RECORD_LEN {
            return Err(StateError::Corrupt("wrong record length"));
        }
        if get_u32(bytes, 0) != MAGIC {
            return Err(StateError::Corrupt("bad magic"));
        }
        if get_u32(bytes, CHECKSUM_OFFSET) != checksum(&bytes[..CHECKSUM_OFFSET]) {
            return Err(StateError::Corrupt("checksum mismatch"));
        }

        let pending_duty = DutyCycleConfig {
            init_tick_period_secs: get_u32(bytes, 28),
            init_tick_modulo: get_u32(bytes, 32),
            ready_tick_period1_secs: get_u32(bytes, 36),
            ready_tick_period2_secs: get_u32(bytes, 40),
            ready_tick_modulo: get_u32(bytes, 44),
            max_sleep_chunk_ms: get_u64(bytes, 48),
        };
        let pending_duty = if pending_duty.validate().is_ok() {
            pending_duty
        } else {
            log::warn!("Retained duty-cycle timing invalid, using defaults");
            DutyCycleConfig::default()
        };

        let url_len = (bytes[64] as usize).min(MAX_URL_LEN);
        let server_url = std::str::from_utf8(&bytes[65..65 + url_len])
            .ok()
            .and_then(|s| s.parse::<ServerUrl>().ok())
            .unwrap_or_default();
        let duration_limit = get_u32(bytes, 60);

        let pending_audio = AudioConfig {
            streaming_enabled: bytes[56] != 0,
            transport_mode: TransportMode::from_byte(bytes[57]),
            gain: if bytes[58] == 1 {
                Gain::try_from(Some(bytes[59] as i8)).unwrap_or_default()
            } else {
                Gain::Auto
            },
            duration_limit_secs: (duration_limit > 0).then_some(duration_limit),
            server_url,
        };

        Ok(Self {
            history_marker: HistoryMarker::from_raw(get_u32(bytes, 4)),
            sleep_window: SleepWindow {
                entered_at: get_u64(bytes, 8),
                wake_at: get_u64(bytes, 16),
            },
            wake_tick_counter: get_u32(bytes, 24),
            pending_duty,
            pending_audio,
        })
    }
}

/// Backing storage for the retained record.
///
/// Implementations only read and write raw bytes; [`load`](Self::load) and
/// [`store`](Self::store) handle encoding.
pub trait RetainedStore: Send {
    /// Read the raw record, or `None` if the region was never written.
    fn read_raw(&self) -> Result<Option<Vec<u8>>, StateError>;

    /// Overwrite the raw record.
    fn write_raw(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StateError>;

    /// Read the state, treating anything unreadable as a power-on reset.
    fn load(&self) -> PersistentState {
        match self.read_raw() {
            Ok(Some(bytes)) => match PersistentState::decode(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("Retained state unusable ({}), treating as power-on", e);
                    PersistentState::default()
                }
            },
            Ok(None) => {
                log::debug!("No retained state found");
                PersistentState::default()
            }
            Err(e) => {
                log::warn!("Failed to read retained state: {}", e);
                PersistentState::default()
            }
        }
    }

    /// Encode and write the state, then read it back to verify.
    fn store(&mut self, state: &PersistentState) -> Result<(), StateError> {
        let record = state.encode();
        self.write_raw(&record)?;

        match self.read_raw()? {
            Some(read_back) if read_back[..] == record[..] => Ok(()),
            _ => {
                log::error!("Retained state verification failed after write");
                Err(StateError::VerifyFailed)
            }
        }
    }
}

/// In-memory store. Clones share the same region, so a clone held across a
/// simulated reset sees what was written before it.
#[derive(Debug, Clone, Default)]
pub struct MemoryRetainedStore {
    region: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryRetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the region with arbitrary bytes (simulates garbage after power loss).
    pub fn fill_raw(&self, bytes: &[u8]) {
        *self.region.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes.to_vec());
    }
}

impl RetainedStore for MemoryRetainedStore {
    fn read_raw(&self) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.region.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn write_raw(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StateError> {
        *self.region.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.to_vec());
        Ok(())
    }
}

/// Retained state errors.
#[derive(Debug)]
pub enum StateError {
    /// Record failed an integrity check.
    Corrupt(&'static str),
    /// Read-back after write did not match.
    VerifyFailed,
    /// Backing storage I/O error.
    Io(std::io::Error),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(reason) => write!(f, "corrupt retained record: {}", reason),
            Self::VerifyFailed => write!(f, "retained record verification failed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// FNV-1a over the record body.
fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811C_9DC5u32, |hash, byte| {
        (hash ^ *byte as u32).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standby_state() -> PersistentState {
        PersistentState {
            history_marker: HistoryMarker::Standby,
            sleep_window: SleepWindow {
                entered_at: 1_700_000_000,
                wake_at: 1_700_000_060,
            },
            wake_tick_counter: 7,
            pending_duty: DutyCycleConfig {
                ready_tick_modulo: 12,
                ..Default::default()
            },
            pending_audio: AudioConfig {
                streaming_enabled: false,
                duration_limit_secs: Some(30),
                gain: Gain::Fixed(-6),
                transport_mode: TransportMode::Tcp,
                server_url: "audio.example.net:6001".parse().unwrap(),
            },
        }
    }

    #[test]
    fn test_marker_garbage_decodes_to_unknown() {
        assert_eq!(HistoryMarker::from_raw(0), HistoryMarker::Unknown);
        assert_eq!(HistoryMarker::from_raw(0xFFFF_FFFF), HistoryMarker::Unknown);
        assert_eq!(HistoryMarker::from_raw(1), HistoryMarker::Unknown);
        for marker in [HistoryMarker::Off, HistoryMarker::Standby, HistoryMarker::Normal] {
            assert_eq!(HistoryMarker::from_raw(marker.to_raw()), marker);
        }
    }

    #[test]
    fn test_store_then_load_after_reset() {
        let mut store = MemoryRetainedStore::new();
        let state = standby_state();
        store.store(&state).unwrap();

        // A fresh handle on the same region stands in for the post-reset reader.
        let after_reset = store.clone();
        let loaded = after_reset.load();
        assert_eq!(loaded.history_marker, HistoryMarker::Standby);
        assert_eq!(loaded.standby_window().map(|w| w.wake_at), Some(1_700_000_060));
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_off_marker_survives_reset() {
        let mut store = MemoryRetainedStore::new();
        let state = PersistentState {
            history_marker: HistoryMarker::Off,
            ..Default::default()
        };
        store.store(&state).unwrap();
        let loaded = store.clone().load();
        assert_eq!(loaded.history_marker, HistoryMarker::Off);
        assert!(loaded.standby_window().is_none());
    }

    #[test]
    fn test_empty_region_loads_default() {
        let store = MemoryRetainedStore::new();
        assert_eq!(store.load(), PersistentState::default());
    }

    #[test]
    fn test_garbage_region_loads_default() {
        let store = MemoryRetainedStore::new();
        store.fill_raw(&[0xA5; RECORD_LEN]);
        assert_eq!(store.load().history_marker, HistoryMarker::Unknown);

        store.fill_raw(&[1, 2, 3]);
        assert_eq!(store.load().history_marker, HistoryMarker::Unknown);
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let mut record = standby_state().encode();
        record[20] ^= 0x01;
        assert!(matches!(
            PersistentState::decode(&record),
            Err(StateError::Corrupt("checksum mismatch"))
        ));
    }

    #[test]
    fn test_invalid_pending_duty_falls_back() {
        let mut state = standby_state();
        state.pending_duty.ready_tick_modulo = 0;
        let decoded = PersistentState::decode(&state.encode()).unwrap();
        assert_eq!(decoded.pending_duty, DutyCycleConfig::default());
        assert_eq!(decoded.history_marker, HistoryMarker::Standby);
    }

    #[test]
    fn test_unlimited_duration_roundtrips_as_none() {
        let mut state = standby_state();
        state.pending_audio.duration_limit_secs = None;
        let decoded = PersistentState::decode(&state.encode()).unwrap();
        assert_eq!(decoded.pending_audio.duration_limit_secs, None);
    }
}
