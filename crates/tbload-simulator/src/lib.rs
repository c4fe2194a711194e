//! Telemetry load generator and test lifecycle engine for IoT ingestion
//! platforms.
//!
//! A run provisions a fleet of simulated devices (directly connected or
//! multiplexed behind gateways), announces them, publishes telemetry at a
//! fixed aggregate rate for a fixed duration and reports what was sent,
//! acknowledged, retried and dropped.
//!
//! # Lifecycle
//! `INIT -> PROVISION -> WARMUP -> RUN -> CLEANUP -> DONE`, with `FAILED`
//! reachable from any non-terminal phase. Cleanup always runs.
//!
//! # Collaborators
//! - `Connector` / `Transport`: MQTT via rumqttc, or an in-memory broker
//! - `Provisioner`: ThingsBoard-style REST API, or an in-memory registry
//!
//! # Usage
//! ```bash
//! # Write a starter plan
//! tbload-simulator init-config --output plan.yaml
//!
//! # Run it against a live platform
//! tbload-simulator run --plan plan.yaml --output report
//!
//! # Exercise the whole lifecycle without a platform
//! tbload-simulator run --plan plan.yaml --dry-run
//! ```

pub mod aggregator;
pub mod alarm;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fleet;
pub mod orchestrator;
pub mod payload;
pub mod pool;
pub mod provision;
pub mod publisher;
pub mod queue;
pub mod rate;
pub mod report;
pub mod transport;

pub use aggregator::{Event, Metrics, ResultAggregator};
pub use config::{DeviceRange, TestPlan};
pub use error::{EngineError, Result};
pub use fleet::{Classifier, Fleet};
pub use orchestrator::{Orchestrator, PhaseMachine};
pub use payload::{PayloadRegistry, PayloadType};
pub use provision::{MemoryProvisioner, Provisioner, RestProvisioner};
pub use report::{PhaseReport, PhaseStatus, RunReport};
pub use transport::{Connector, MemoryBroker, MqttConnector, Transport};
