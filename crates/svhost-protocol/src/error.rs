//! Host error type shared by the registry, the services, and the control channel.

use thiserror::Error;

use crate::command::CommandError;
use crate::status::StatusCode;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("port {0} is already registered")]
    DuplicatePort(u16),

    #[error("service name '{0}' is already registered")]
    DuplicateName(String),

    #[error("no service registered on port {0}")]
    UnknownPort(u16),

    #[error("no service named '{0}'")]
    UnknownService(String),

    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),

    #[error("attribute '{0}' not found")]
    AttributeNotFound(String),

    #[error("service '{0}' is not running")]
    NotRunning(String),

    #[error("service '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("service '{name}' failed validation: {reason}")]
    ValidationFailed { name: String, reason: String },

    #[error("system service '{0}' cannot be stopped remotely")]
    SystemService(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub fn start_failed(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StartFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn validation_failed(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ValidationFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Control-protocol status slot reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SystemService(_) => StatusCode::Unauthorized,
            Self::StartFailed { .. } | Self::ValidationFailed { .. } | Self::Io(_) => {
                StatusCode::SystemError
            }
            Self::DuplicatePort(_)
            | Self::DuplicateName(_)
            | Self::UnknownPort(_)
            | Self::UnknownService(_)
            | Self::UnknownServiceType(_)
            | Self::AttributeNotFound(_)
            | Self::NotRunning(_)
            | Self::Config(_)
            | Self::Command(_) => StatusCode::InvalidContent,
        }
    }
}

impl From<toml::de::Error> for HostError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
