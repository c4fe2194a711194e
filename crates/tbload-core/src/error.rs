//! Error types for tbload-core

use crate::types::PhaseState;
use thiserror::Error;

/// Core error types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("Empty device name")]
    EmptyDeviceName,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: PhaseState, to: PhaseState },

    #[error("Retry budget exhausted for phase {phase} after {attempts} attempts")]
    RetryExhausted { phase: PhaseState, attempts: u32 },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
