//! Core data types for the tbload load generator

use crate::error::{CoreError, Result};
use fxhash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Per-device deterministic seed
pub type DeviceSeed = u64;

/// Epoch milliseconds, as carried in telemetry envelopes
pub type EpochMillis = i64;

/// Name of a simulated device or gateway.
///
/// The name doubles as the entity name on the ingestion platform and, unless
/// provisioning hands back something else, as the access token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from an arbitrary non-empty name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::EmptyDeviceName);
        }
        Ok(Self(name))
    }

    /// Create the id for the device at `index` (e.g. `DW00000015`)
    pub fn indexed(prefix: &str, index: u64) -> Self {
        Self(format!("{}{:08}", prefix, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable seed derived from the name; identical across runs and processes
    pub fn seed(&self) -> DeviceSeed {
        compute_device_seed(&self.0)
    }

    /// Numeric suffix of the name, if any (`DW00000042` -> 42)
    pub fn index(&self) -> Option<u64> {
        let digits: String = self
            .0
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the per-device seed from a device name.
/// Uses FxHash, which has no per-process random state.
pub fn compute_device_seed(name: &str) -> DeviceSeed {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Role of a simulated client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// A device owning its own connection
    Device,
    /// A gateway multiplexing many child devices over one connection
    Gateway,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Device => "device",
            ClientRole::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How simulated devices reach the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Each device owns its own transport connection
    #[default]
    Direct,
    /// One connection per gateway, child devices multiplexed by envelope
    Gateway,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Direct => write!(f, "direct"),
            ConnectionMode::Gateway => write!(f, "gateway"),
        }
    }
}

/// Special-device classification.
///
/// Resolved from the static lists in the test plan, never from randomness, so a
/// device keeps its category across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    #[default]
    Normal,
    /// Permanently alarming
    Alarm,
    /// Running but with elevated vibration
    VibrationWarning,
    /// Connected but stopped (zero speed)
    Stopped,
    /// Connected during warmup, silent afterwards
    Offline,
}

impl DeviceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::Normal => "normal",
            DeviceCategory::Alarm => "alarm",
            DeviceCategory::VibrationWarning => "vibration_warning",
            DeviceCategory::Stopped => "stopped",
            DeviceCategory::Offline => "offline",
        }
    }

    /// Whether the device takes part in telemetry scheduling
    pub fn emits_telemetry(&self) -> bool {
        !matches!(self, DeviceCategory::Offline)
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of message carried to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Gateway announces a child device
    Connect,
    Telemetry,
    Attributes,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Connect => "connect",
            EnvelopeKind::Telemetry => "telemetry",
            EnvelopeKind::Attributes => "attributes",
        }
    }

    /// Topic for this envelope when sent on behalf of a device in `mode`.
    ///
    /// Direct devices have no connect envelope; their connection is the
    /// announcement.
    pub fn topic(&self, mode: ConnectionMode) -> Option<&'static str> {
        match (mode, self) {
            (ConnectionMode::Direct, EnvelopeKind::Connect) => None,
            (ConnectionMode::Direct, EnvelopeKind::Telemetry) => Some("v1/devices/me/telemetry"),
            (ConnectionMode::Direct, EnvelopeKind::Attributes) => Some("v1/devices/me/attributes"),
            (ConnectionMode::Gateway, EnvelopeKind::Connect) => Some("v1/gateway/connect"),
            (ConnectionMode::Gateway, EnvelopeKind::Telemetry) => Some("v1/gateway/telemetry"),
            (ConnectionMode::Gateway, EnvelopeKind::Attributes) => Some("v1/gateway/attributes"),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Test lifecycle phase.
///
/// `Init -> Provision -> Warmup -> Run -> Cleanup -> Done`, with `Failed`
/// reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Init,
    Provision,
    Warmup,
    Run,
    Cleanup,
    Done,
    Failed,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Init => "init",
            PhaseState::Provision => "provision",
            PhaseState::Warmup => "warmup",
            PhaseState::Run => "run",
            PhaseState::Cleanup => "cleanup",
            PhaseState::Done => "done",
            PhaseState::Failed => "failed",
        }
    }

    /// The phase that follows on success, if any
    pub fn successor(&self) -> Option<PhaseState> {
        match self {
            PhaseState::Init => Some(PhaseState::Provision),
            PhaseState::Provision => Some(PhaseState::Warmup),
            PhaseState::Warmup => Some(PhaseState::Run),
            PhaseState::Run => Some(PhaseState::Cleanup),
            PhaseState::Cleanup => Some(PhaseState::Done),
            PhaseState::Done | PhaseState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Done | PhaseState::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: PhaseState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == PhaseState::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
