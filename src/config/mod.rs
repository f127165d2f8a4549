//! Node configuration management.
//!
//! # Components
//!
//! - [`duty`] - Tick periods and moduli of the duty-cycle controller
//! - [`audio`] - Audio session parameters written by the remote object layer
//! - [`node`] - Transport tuning, capture sizing and whole-node file loading
//!
//! All types are platform-independent and host-testable.

mod audio;
mod duty;
mod error;
mod node;

pub use audio::{AudioConfig, Gain, ServerUrl, TransportMode, MAX_GAIN_DB, MAX_URL_LEN, MIN_GAIN_DB};
pub use duty::DutyCycleConfig;
pub use error::{ConfigError, LoadError};
pub use node::{
    CaptureConfig, NodeConfig, RegistrationConfig, TransportTuning, DEFAULT_STATS_PORT,
};
