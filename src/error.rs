//! Error taxonomy of the simulation engine
//!
//! Each enum maps to one failure class and to one containment rule:
//! configuration problems skip the offending item, generator problems
//! deactivate one generator, connect and transport problems end one
//! worker. Only [`FleetError`] ever reaches the caller of the engine.

use std::time::Duration;
use thiserror::Error;

/// Malformed or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Fleet defaults are invalid: {0}")]
    InvalidDefaults(String),

    #[error("Topic #{index} is invalid: {reason}")]
    InvalidTopic { index: usize, reason: String },

    #[error("Generator '{name}' is invalid: {reason}")]
    InvalidGenerator { name: String, reason: String },

    #[error("Unknown generator type '{kind}' for '{name}'")]
    UnknownGeneratorType { name: String, kind: String },

    #[error("Listener section is invalid: {0}")]
    InvalidListener(String),

    #[error("Expression error: {0}")]
    Expression(String),
}

/// Failure inside one value generator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeneratorError {
    #[error("evaluation failed at x={x}: {reason}")]
    Evaluation { x: f64, reason: String },

    #[error("expression produced a non-numeric result at x={x}")]
    NonNumeric { x: f64 },
}

/// Failure to establish a broker session
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("No CONNACK within {0:?}")]
    Timeout(Duration),

    #[error("Transport error while connecting: {0}")]
    Transport(String),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Failure on an established broker session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to broker lost")]
    Disconnected,

    #[error("Client request failed: {0}")]
    Client(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a fleet cannot be started
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration produced no valid device")]
    NoDevices,

    #[error("Command listener '{id}' did not come up: {reason}")]
    ListenerUnavailable { id: String, reason: String },
}
