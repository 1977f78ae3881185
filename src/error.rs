//! Top-level error type for the gateway simulator
//!
//! Each layer has its own error enum; this one aggregates them for callers
//! that drive a whole simulated device, such as the binary.

use crate::config::ConfigError;
use crate::protocol::TopicError;
use crate::transport::mqtt::TransportError;
use thiserror::Error;

/// Main error type for simulator operations
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl SimulatorError {
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Errors the operator can fix by editing the configuration
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Transport(TransportError::InvalidBrokerUrl(_))
                | Self::Transport(TransportError::Topic(_))
        )
    }
}

impl From<TopicError> for SimulatorError {
    fn from(error: TopicError) -> Self {
        Self::Transport(TransportError::Topic(error))
    }
}

impl From<std::io::Error> for SimulatorError {
    fn from(error: std::io::Error) -> Self {
        Self::runtime(error.to_string())
    }
}

/// Result type alias for simulator operations
pub type SimulatorResult<T> = Result<T, SimulatorError>;
