//! Battery-powered audio streaming node.
//!
//! A duty-cycled device that registers with a management server, reports on
//! a tick schedule, streams microphone audio over TCP or UDP on request and
//! sleeps as deeply as its power source allows. State that must survive a
//! halt lives in a small retained record.
//!
//! This library contains platform-independent components that can be tested
//! on the host machine without ESP32 hardware; ESP-IDF drivers sit behind the
//! `esp32` feature.

pub mod audio;
pub mod clock;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod network;
pub mod node;
#[cfg(feature = "esp32")]
pub mod persistence;
pub mod persistence_host;
pub mod power;
pub mod resource;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-export commonly used items
pub use audio::{AudioPipeline, SessionEnd, SessionState, StartError};
pub use config::{AudioConfig, DutyCycleConfig, NodeConfig, TransportMode, DEFAULT_STATS_PORT};
pub use controller::{DeviceMode, DutyCycleController, SleepLevel};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use network::StatsServer;
pub use node::{Node, NodeDrivers, NodeError};
pub use resource::{ResourceRegistry, Value};
