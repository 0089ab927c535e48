//! Error types for the monitoring core

use thiserror::Error;

/// Result type alias for monitoring operations
pub type Result<T> = std::result::Result<T, MonitoringError>;

/// Error types for monitoring operations
#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    #[error("Probe error: {check} - {message}")]
    Probe { check: String, message: String },

    #[error("Workflow error: {execution} - {message}")]
    Workflow { execution: String, message: String },

    #[error("Delivery timed out for channel: {channel}")]
    DeliveryTimeout { channel: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitoringError {
    /// Create a new channel error
    pub fn channel<S: Into<String>>(channel: S, message: S) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a new probe error
    pub fn probe<S: Into<String>>(check: S, message: S) -> Self {
        Self::Probe {
            check: check.into(),
            message: message.into(),
        }
    }

    /// Create a new workflow error
    pub fn workflow<S: Into<String>>(execution: S, message: S) -> Self {
        Self::Workflow {
            execution: execution.into(),
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitoringError::Network(_) => true,
            MonitoringError::Channel { .. } => true,
            MonitoringError::DeliveryTimeout { .. } => true,
            _ => false,
        }
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            MonitoringError::Config(_) => "config",
            MonitoringError::Validation(_) => "validation",
            MonitoringError::Network(_) => "network",
            MonitoringError::Serialization(_) => "serialization",
            MonitoringError::Io(_) => "io",
            MonitoringError::Channel { .. } => "channel",
            MonitoringError::Probe { .. } => "probe",
            MonitoringError::Workflow { .. } => "workflow",
            MonitoringError::DeliveryTimeout { .. } => "timeout",
            MonitoringError::Internal(_) => "internal",
        }
    }
}
