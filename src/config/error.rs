use std::fmt;

/// Errors that can occur while building or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric field is out of range.
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    /// Server address could not be parsed.
    InvalidUrl(String),
    /// Unknown transport name.
    UnknownTransport(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => write!(f, "invalid {}: {}", field, reason),
            Self::InvalidUrl(msg) => write!(f, "invalid server URL: {}", msg),
            Self::UnknownTransport(name) => write!(f, "unknown transport: {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors loading a node configuration file.
#[derive(Debug)]
pub enum LoadError {
    /// File could not be read.
    Io(std::io::Error),
    /// File is not valid JSON for [`NodeConfig`](super::NodeConfig).
    Parse(serde_json::Error),
    /// File parsed but a value is invalid.
    Invalid(ConfigError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Parse(e) => write!(f, "parse error: {}", e),
            Self::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

impl From<ConfigError> for LoadError {
    fn from(e: ConfigError) -> Self {
        Self::Invalid(e)
    }
}
