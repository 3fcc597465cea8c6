//! Error types for serialbus
//!
//! All modules use `SerialBusResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for serialbus operations
pub type SerialBusResult<T> = Result<T, SerialBusError>;

/// All errors that can occur in serialbus
#[derive(Error, Debug)]
pub enum SerialBusError {
    // Session errors
    #[error("No such port: {0}")]
    NotFound(String),

    #[error("{requester} is not the owner of {device}")]
    Forbidden { device: String, requester: String },

    #[error("Device already in use: {0}")]
    DeviceInUse(String),

    #[error("No free RFCOMM device id (limit {limit})")]
    NoFreeDevice { limit: u16 },

    // Bus errors
    #[error("Failed to register {path}: {reason}")]
    Registration { path: String, reason: String },

    #[error("Bus out of resources while {0}")]
    ResourceExhausted(String),

    #[error("Unknown method {interface}.{method}")]
    UnknownMethod { interface: String, method: String },

    // Input errors
    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl SerialBusError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a registration error for a bus object path
    pub fn registration(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error code, used in daemon replies
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Forbidden { .. } => "forbidden",
            Self::DeviceInUse(_) => "device-in-use",
            Self::NoFreeDevice { .. } => "no-free-device",
            Self::Registration { .. } => "registration-failure",
            Self::ResourceExhausted(_) => "resource-exhaustion",
            Self::UnknownMethod { .. } => "unknown-method",
            Self::InvalidAddress(_) | Self::InvalidRequest(_) => "invalid-request",
            Self::ConfigInvalid { .. } | Self::ConfigDirCreate { .. } => "config",
            Self::Io { .. } => "io",
            Self::Json(_) | Self::TomlParse(_) | Self::TomlSerialize(_) => "serialization",
        }
    }

    /// Check if the same request may succeed later, once ports are released
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_) | Self::NoFreeDevice { .. } | Self::Registration { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Forbidden { .. } => {
                Some("Only the bus client that connected a port may disconnect it")
            }
            Self::NoFreeDevice { .. } => Some("Release an RFCOMM port or raise serial.max_devices"),
            Self::ConfigInvalid { .. } => Some("Run: serialbus config init --force"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SerialBusError::Forbidden {
            device: "/dev/rfcomm0".to_string(),
            requester: ":1.42".to_string(),
        };
        assert_eq!(err.to_string(), ":1.42 is not the owner of /dev/rfcomm0");
    }

    #[test]
    fn error_codes() {
        assert_eq!(SerialBusError::NotFound("x".into()).code(), "not-found");
        assert_eq!(
            SerialBusError::registration("/org/bluez/serial/rfcomm0", "no memory").code(),
            "registration-failure"
        );
        assert_eq!(
            SerialBusError::ResourceExhausted("creating object".into()).code(),
            "resource-exhaustion"
        );
    }

    #[test]
    fn error_hint() {
        let err = SerialBusError::NoFreeDevice { limit: 4 };
        assert!(err.hint().unwrap().contains("max_devices"));
        assert!(SerialBusError::NotFound("x".into()).hint().is_none());
    }

    #[test]
    fn error_retryable() {
        assert!(SerialBusError::ResourceExhausted("x".into()).is_retryable());
        assert!(!SerialBusError::NotFound("x".into()).is_retryable());
    }
}
