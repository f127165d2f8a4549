//! Duty-cycle controller.
//!
//! # Components
//!
//! - [`DutyCycleController`] - boot decision, the two operating modes and
//!   sleep transitions
//! - [`ControllerHandle`] - shared view used by tick handlers and the remote
//!   resource layer
//! - [`Registrar`] - management-server registration collaborator
//!
//! Lifecycle:
//!
//! ```text
//! boot ──▶ Initialisation ──register──▶ Ready ──exit──▶ shutdown
//!              │                          │
//!              ├─▶ DeregisteredSleep ─────┤──▶ (halt, resume at boot)
//!              └─▶ Off ◀──────────────────┘
//! ```

mod duty;
mod registrar;

pub use duty::{ControllerDeps, ControllerHandle, DutyCycleController};
pub use registrar::{Registrar, TcpProbeRegistrar};

use crate::audio::AudioPipeline;
use crate::config::AudioConfig;
use std::fmt;
use std::time::Duration;

/// Operating mode while awake. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Trying to register with the management server.
    Initialisation,
    /// Registered; periodic reporting.
    Ready,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialisation => write!(f, "initialisation"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Depth of a sleep transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepLevel {
    /// Awake and registered.
    Registered,
    /// Light sleep; the device stays booted and registered.
    RegisteredSleep,
    /// CPU halted for a timed interval; resumes at boot.
    DeregisteredSleep,
    /// CPU halted with no timed wake.
    Off,
}

impl SleepLevel {
    /// Whether this level halts the CPU.
    pub fn halts(self) -> bool {
        matches!(self, Self::DeregisteredSleep | Self::Off)
    }
}

/// What `boot` decided from the retained record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// The timed sleep has not finished; halt again for the remainder.
    ResumeStandbySleep(Duration),
    /// The device was switched off; start over.
    ResumeOff,
    /// Power-on or expired sleep; start Initialisation.
    RunInitialisation,
}

/// How a mode (or a sleep) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeExit {
    /// Still booted and registered.
    Registered,
    /// The CPU halted; on host the call returned and the caller must boot again.
    Halted(SleepLevel),
    /// The local exit signal was observed.
    Shutdown,
}

/// What the controller needs from the audio session.
pub trait SessionMonitor: Send + Sync {
    fn is_streaming(&self) -> bool;
    /// Pending audio parameters, persisted across halts.
    fn pending_audio(&self) -> AudioConfig;
    /// Stop the session before the CPU halts.
    fn end_session(&self);
}

impl SessionMonitor for AudioPipeline {
    fn is_streaming(&self) -> bool {
        AudioPipeline::is_streaming(self)
    }

    fn pending_audio(&self) -> AudioConfig {
        self.pending_config()
    }

    fn end_session(&self) {
        self.stop_session();
    }
}
