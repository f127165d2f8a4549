//! Network availability and the stats endpoint.
//!
//! The transport asks a [`NetworkProvider`] whether the link layer is up
//! before it opens a socket, so "no network" is reported distinctly from a
//! refused connection.
//!
//! - **Host**: [`HostNetwork`], the OS owns the interface
//! - **ESP32** (`esp32` feature): [`WifiNetwork`], station-mode WiFi

use std::net::IpAddr;

mod host;
mod stats_server;
#[cfg(feature = "esp32")]
mod wifi;

pub use host::HostNetwork;
pub use stats_server::{NodeStatus, StatsServer, StatusSource};
#[cfg(feature = "esp32")]
pub use wifi::WifiNetwork;

/// Network provider abstraction.
pub trait NetworkProvider: Send + Sync {
    /// Bring the interface up.
    fn connect(&self) -> Result<(), NetworkError>;

    /// Whether sockets can be opened right now.
    fn is_connected(&self) -> bool;

    /// Local address, `None` while disconnected.
    fn ip_addr(&self) -> Option<IpAddr>;
}

/// Network errors.
#[derive(Debug)]
pub enum NetworkError {
    /// No WiFi credentials configured.
    NotConfigured,
    /// Credentials do not fit the driver's limits.
    InvalidCredentials,
    /// The driver failed to join or obtain an address.
    Driver(String),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "network not configured"),
            Self::InvalidCredentials => write!(f, "invalid WiFi credentials"),
            Self::Driver(msg) => write!(f, "network driver error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Driver(format!("{:?}", e))
    }
}
