//! Error types for the load generator.

use std::time::Duration;
use tbload_core::{CoreError, PhaseState};
use thiserror::Error;

/// Failures of the underlying transport (MQTT or in-memory).
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Connection closed")]
    Closed,
}

/// A client could not be brought up.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect {client} after {attempts} attempts: {source}")]
    Exhausted {
        client: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Client {0} is not in the pool")]
    UnknownClient(String),

    #[error("Client {0} is unhealthy")]
    Unhealthy(String),
}

/// A single publish attempt failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Payload encoding failed: {0}")]
    Encode(String),
}

/// The provisioning collaborator reported an error.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned error: {status} - {body}")]
    Server { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Provisioning rejected: {0}")]
    Rejected(String),
}

/// A lifecycle phase ran past its time limit.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Phase {phase} exceeded its timeout of {timeout:?}")]
pub struct PhaseTimeoutError {
    pub phase: PhaseState,
    pub timeout: Duration,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("{0}")]
    PhaseTimeout(#[from] PhaseTimeoutError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Only {connected} clients connected, {required} required")]
    InsufficientClients { connected: usize, required: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
