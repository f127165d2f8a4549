//! Whole-node configuration and file loading.

use super::{AudioConfig, ConfigError, DutyCycleConfig, LoadError, ServerUrl};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Timing constants of the audio transport.
///
/// The per-block budget and the fatal-failure threshold are independent
/// values; neither is derived from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTuning {
    /// DNS + connect timeout when a session starts.
    pub connect_timeout_ms: u64,
    /// Wall-clock budget for retrying partial writes of one send.
    pub send_budget_ms: u64,
    /// Duration of one audio block; sends slower than this are over budget.
    pub block_budget_us: u64,
    /// Consecutive send failures lasting this long end the session.
    pub fatal_failure_threshold_ms: u64,
    /// Sender worker wake-up timeout when no datagram is signalled.
    pub signal_wait_ms: u64,
    /// Pause between stopping capture and joining the sender.
    pub drain_interval_ms: u64,
    /// Datagrams batched into one TCP send.
    pub tcp_datagrams_per_send: usize,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            send_budget_ms: 200,
            block_budget_us: 20_000,
            fatal_failure_threshold_ms: 10_000,
            signal_wait_ms: 100,
            drain_interval_ms: 50,
            tcp_datagrams_per_send: 8,
        }
    }
}

impl TransportTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_budget(&self) -> Duration {
        Duration::from_millis(self.send_budget_ms)
    }

    pub fn block_budget(&self) -> Duration {
        Duration::from_micros(self.block_budget_us)
    }

    pub fn fatal_failure_threshold(&self) -> Duration {
        Duration::from_millis(self.fatal_failure_threshold_ms)
    }

    pub fn signal_wait(&self) -> Duration {
        Duration::from_millis(self.signal_wait_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout_ms",
                reason: "must be > 0",
            });
        }
        if self.send_budget_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "send_budget_ms",
                reason: "must be > 0",
            });
        }
        if self.block_budget_us == 0 {
            return Err(ConfigError::InvalidValue {
                field: "block_budget_us",
                reason: "must be > 0",
            });
        }
        if self.signal_wait_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signal_wait_ms",
                reason: "must be > 0",
            });
        }
        if self.tcp_datagrams_per_send == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tcp_datagrams_per_send",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Microphone capture and codec pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate of the raw capture.
    pub sample_rate_hz: u32,
    /// Samples per half of the double buffer.
    pub block_samples: usize,
    /// Size of one encoded datagram.
    pub datagram_bytes: usize,
    /// Datagrams in the codec's bounded store.
    pub pool_datagrams: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            block_samples: 320,
            datagram_bytes: 160,
            pool_datagrams: 64,
        }
    }
}

impl CaptureConfig {
    /// Time to fill one half of the double buffer.
    pub fn block_period(&self) -> Duration {
        Duration::from_micros(self.block_samples as u64 * 1_000_000 / self.sample_rate_hz as u64)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate_hz == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sample_rate_hz",
                reason: "must be > 0",
            });
        }
        if self.block_samples == 0 {
            return Err(ConfigError::InvalidValue {
                field: "block_samples",
                reason: "must be > 0",
            });
        }
        if self.datagram_bytes == 0 || self.datagram_bytes % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "datagram_bytes",
                reason: "must be a non-zero multiple of 2",
            });
        }
        if self.pool_datagrams == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_datagrams",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Management server registration settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Management server address. `None` registers immediately (offline development).
    pub server: Option<ServerUrl>,
    /// Connection attempts per registration call.
    pub attempts: u32,
    /// Timeout of each attempt.
    pub attempt_timeout_ms: u64,
}

impl RegistrationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }
}

/// Complete node configuration.
///
/// Every section is optional in the file; missing sections use defaults.
///
/// ```
/// use iot_audio_node::config::NodeConfig;
///
/// let config = NodeConfig::from_json(r#"{"duty":{"ready_tick_modulo":30}}"#).unwrap();
/// assert_eq!(config.duty.ready_tick_modulo, 30);
/// assert_eq!(config.stats_port, Some(8080));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub duty: DutyCycleConfig,
    pub audio: AudioConfig,
    pub transport: TransportTuning,
    pub capture: CaptureConfig,
    pub registration: RegistrationConfig,
    /// Stats server port; `None` disables the server.
    pub stats_port: Option<u16>,
    /// Backing file for retained state on host builds.
    pub retained_state_path: Option<PathBuf>,
    /// Whether the simulated power driver reports external power.
    pub external_power: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            duty: DutyCycleConfig::default(),
            audio: AudioConfig::default(),
            transport: TransportTuning::default(),
            capture: CaptureConfig::default(),
            registration: RegistrationConfig {
                server: None,
                attempts: 3,
                attempt_timeout_ms: 5_000,
            },
            stats_port: Some(DEFAULT_STATS_PORT),
            retained_state_path: None,
            external_power: false,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.duty.validate()?;
        self.transport.validate()?;
        self.capture.validate()?;
        Ok(())
    }
}
