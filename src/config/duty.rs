//! Duty-cycle timing configuration.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tick timing for the two operating modes.
///
/// Values are whole seconds so they fit the retained record unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutyCycleConfig {
    /// Tick period while trying to register.
    pub init_tick_period_secs: u32,
    /// Ticks between power checks while trying to register.
    pub init_tick_modulo: u32,
    /// Short tick period in Ready mode.
    pub ready_tick_period1_secs: u32,
    /// Long tick period in Ready mode (external power, no audio).
    pub ready_tick_period2_secs: u32,
    /// Ready ticks before the sleep-level decision is taken.
    pub ready_tick_modulo: u32,
    /// Longest uninterrupted sleep chunk before liveness must be serviced.
    pub max_sleep_chunk_ms: u64,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            init_tick_period_secs: 60,
            init_tick_modulo: 10,
            ready_tick_period1_secs: 60,
            ready_tick_period2_secs: 3600,
            ready_tick_modulo: 60,
            max_sleep_chunk_ms: 1000,
        }
    }
}

impl DutyCycleConfig {
    /// Initialisation tick period.
    pub fn init_tick_period(&self) -> Duration {
        Duration::from_secs(self.init_tick_period_secs as u64)
    }

    /// Short Ready tick period.
    pub fn ready_tick_period1(&self) -> Duration {
        Duration::from_secs(self.ready_tick_period1_secs as u64)
    }

    /// Long Ready tick period.
    pub fn ready_tick_period2(&self) -> Duration {
        Duration::from_secs(self.ready_tick_period2_secs as u64)
    }

    /// Maximum sleep chunk.
    pub fn max_sleep_chunk(&self) -> Duration {
        Duration::from_millis(self.max_sleep_chunk_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_tick_period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "init_tick_period_secs",
                reason: "must be > 0",
            });
        }
        if self.init_tick_modulo == 0 {
            return Err(ConfigError::InvalidValue {
                field: "init_tick_modulo",
                reason: "must be > 0",
            });
        }
        if self.ready_tick_period1_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ready_tick_period1_secs",
                reason: "must be > 0",
            });
        }
        if self.ready_tick_period2_secs < self.ready_tick_period1_secs {
            return Err(ConfigError::InvalidValue {
                field: "ready_tick_period2_secs",
                reason: "must be >= ready_tick_period1_secs",
            });
        }
        if self.ready_tick_modulo == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ready_tick_modulo",
                reason: "must be > 0",
            });
        }
        if self.max_sleep_chunk_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_sleep_chunk_ms",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DutyCycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ready_tick_period1(), Duration::from_secs(60));
        assert_eq!(config.ready_tick_period2(), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_period_rejected() {
        let config = DutyCycleConfig {
            init_tick_period_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "init_tick_period_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_modulo_rejected() {
        let config = DutyCycleConfig {
            ready_tick_modulo: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_long_period_shorter_than_short_rejected() {
        let config = DutyCycleConfig {
            ready_tick_period1_secs: 120,
            ready_tick_period2_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DutyCycleConfig = serde_json::from_str(r#"{"ready_tick_modulo":5}"#).unwrap();
        assert_eq!(config.ready_tick_modulo, 5);
        assert_eq!(config.init_tick_modulo, 10);
    }
}
