//! Retained state for host (development) builds.
//!
//! A file stands in for memory that survives a low-power halt, so a host node
//! restarted after a simulated sleep resumes where it left off. Uses
//! `~/.iot-audio-node/retained.bin` by default.

use crate::state::{RetainedStore, StateError, RECORD_LEN};
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the default retained-state file path.
///
/// Returns `~/.iot-audio-node/retained.bin`
pub fn default_state_path() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".iot-audio-node")
        .join("retained.bin"))
}

/// File-backed [`RetainedStore`].
#[derive(Debug, Clone)]
pub struct FileRetainedStore {
    path: PathBuf,
}

impl FileRetainedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`default_state_path`].
    pub fn at_default_path() -> io::Result<Self> {
        Ok(Self::new(default_state_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RetainedStore for FileRetainedStore {
    fn read_raw(&self) -> Result<Option<Vec<u8>>, StateError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No retained state file at {:?}", self.path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash mid-write leaves the old record intact.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, record)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Retained state written to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HistoryMarker, PersistentState, SleepWindow};
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test files even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_state_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir()
            .join(format!("iot-audio-node-test-{}-{}", pid, id))
            .join("retained.bin")
    }

    #[test]
    fn test_missing_file_loads_power_on_state() {
        let store = FileRetainedStore::new(unique_state_path());
        assert_eq!(store.read_raw().unwrap(), None);
        assert_eq!(store.load().history_marker, HistoryMarker::Unknown);
    }

    #[test]
    fn test_state_survives_new_store_instance() {
        let path = unique_state_path();
        let state = PersistentState {
            history_marker: HistoryMarker::Standby,
            sleep_window: SleepWindow {
                entered_at: 1_000,
                wake_at: 1_060,
            },
            wake_tick_counter: 3,
            ..PersistentState::default()
        };
        FileRetainedStore::new(&path).store(&state).unwrap();

        let reopened = FileRetainedStore::new(&path);
        assert_eq!(reopened.load(), state);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_truncated_file_loads_power_on_state() {
        let path = unique_state_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, [0u8; 7]).unwrap();

        let store = FileRetainedStore::new(&path);
        assert_eq!(store.load(), PersistentState::default());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
