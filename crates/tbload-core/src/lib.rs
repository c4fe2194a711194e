//! tbload Core - Shared data model for the telemetry load generator
//!
//! This crate provides the types every other tbload component speaks:
//! - `DeviceId`: Name of a simulated device or gateway, with its stable seed
//! - `ClientRole`: Whether a connection belongs to a device or a gateway
//! - `ConnectionMode`: Direct (one connection per device) or gateway multiplexing
//! - `DeviceCategory`: Special-device classification (alarm, offline, stopped, ...)
//! - `EnvelopeKind`: Connect, telemetry and attribute envelopes
//! - `PhaseState`: Test lifecycle phases and their legal transitions

pub mod error;
pub mod types;

pub use error::{CoreError, Result};
pub use types::*;
