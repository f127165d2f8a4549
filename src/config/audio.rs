//! Audio streaming configuration.
//!
//! These types are written by the remote object layer at any time (the
//! pending copy) and frozen into the active copy when a session starts.
//!
//! # Example
//!
//! ```
//! use iot_audio_node::config::{AudioConfig, ServerUrl, TransportMode};
//!
//! let url: ServerUrl = "audio.example.net:5000".parse().unwrap();
//! assert_eq!(url.port(), 5000);
//!
//! let mode: TransportMode = "tcp".parse().unwrap();
//! assert_eq!(mode, TransportMode::Tcp);
//!
//! let config = AudioConfig::default();
//! assert!(!config.streaming_enabled);
//! ```

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum server URL length, bounded by the retained record layout.
pub const MAX_URL_LEN: usize = 64;

/// Maximum fixed gain in dB.
pub const MAX_GAIN_DB: i8 = 48;

/// Minimum fixed gain in dB.
pub const MIN_GAIN_DB: i8 = -24;

/// Network transport used to carry audio datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Stream socket; datagrams are batched into larger sends.
    Tcp,
    /// One network datagram per audio datagram.
    #[default]
    Udp,
}

impl TransportMode {
    /// Wire name used by the resource layer and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Retained-record encoding.
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Tcp => 1,
            Self::Udp => 2,
        }
    }

    /// Retained-record decoding. Unknown values fall back to UDP.
    pub(crate) fn from_byte(value: u8) -> Self {
        match value {
            1 => Self::Tcp,
            _ => Self::Udp,
        }
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ConfigError::UnknownTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audio server address in `host:port` form.
///
/// IPv6 literals must be bracketed (`[::1]:5000`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerUrl {
    host: String,
    port: u16,
}

impl ServerUrl {
    /// Create a server address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let url = Self {
            host: host.into(),
            port,
        };
        url.validate()?;
        Ok(url)
    }

    /// Host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address string suitable for `ToSocketAddrs`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidUrl("empty host".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidUrl("port must be non-zero".into()));
        }
        let len = self.address().len();
        if len > MAX_URL_LEN {
            return Err(ConfigError::InvalidUrl(format!(
                "address too long: {} bytes (max {})",
                len, MAX_URL_LEN
            )));
        }
        Ok(())
    }
}

impl Default for ServerUrl {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl FromStr for ServerUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("udp://")
            .or_else(|| s.strip_prefix("tcp://"))
            .unwrap_or(s);

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidUrl(format!("missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(format!("invalid port: {}", port)))?;

        Self::new(host, port)
    }
}

impl TryFrom<String> for ServerUrl {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerUrl> for String {
    fn from(url: ServerUrl) -> Self {
        url.address()
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Microphone gain applied by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<i8>", into = "Option<i8>")]
pub enum Gain {
    /// Codec adjusts gain from the signal level.
    #[default]
    Auto,
    /// Fixed gain in dB.
    Fixed(i8),
}

impl Gain {
    /// Build a gain from a remote integer value. Any negative value selects
    /// automatic gain, so remote writes can only pick `0..=MAX_GAIN_DB` as a
    /// fixed gain.
    pub fn from_remote(value: i64) -> Result<Self, ConfigError> {
        if value < 0 {
            return Ok(Self::Auto);
        }
        if value > MAX_GAIN_DB as i64 {
            return Err(ConfigError::InvalidValue {
                field: "gain",
                reason: "above maximum gain",
            });
        }
        Ok(Self::Fixed(value as i8))
    }

    /// Integer view used by the resource layer (negative means automatic).
    pub fn to_remote(self) -> i64 {
        match self {
            Self::Auto => i8::MIN as i64,
            Self::Fixed(db) => db as i64,
        }
    }

    /// Linear amplitude factor for a fixed gain.
    pub fn linear(self) -> Option<f32> {
        match self {
            Self::Auto => None,
            Self::Fixed(db) => Some(10f32.powf(db as f32 / 20.0)),
        }
    }
}

impl TryFrom<Option<i8>> for Gain {
    type Error = ConfigError;

    fn try_from(value: Option<i8>) -> Result<Self, Self::Error> {
        match value {
            Some(db) if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&db) => {
                Err(ConfigError::InvalidValue {
                    field: "gain",
                    reason: "outside the fixed gain range",
                })
            }
            Some(db) => Ok(Self::Fixed(db)),
            None => Ok(Self::Auto),
        }
    }
}

impl From<Gain> for Option<i8> {
    fn from(gain: Gain) -> Self {
        match gain {
            Gain::Auto => None,
            Gain::Fixed(db) => Some(db),
        }
    }
}

/// Audio session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Whether a session should be running.
    pub streaming_enabled: bool,
    /// Session stops by itself after this many seconds. `None` streams until stopped.
    pub duration_limit_secs: Option<u32>,
    /// Codec gain.
    pub gain: Gain,
    /// Transport carrying the datagrams.
    pub transport_mode: TransportMode,
    /// Audio server address.
    pub server_url: ServerUrl,
}

impl AudioConfig {
    /// Positive duration limit, if any. Zero is treated as no limit.
    pub fn duration_limit(&self) -> Option<std::time::Duration> {
        self.duration_limit_secs
            .filter(|secs| *secs > 0)
            .map(|secs| std::time::Duration::from_secs(secs as u64))
    }
}
