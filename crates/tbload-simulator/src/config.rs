//! Test plan configuration for the load generator.
//!
//! A `TestPlan` is loaded once from YAML (or built from defaults plus CLI
//! overrides), validated, and then treated as immutable for the whole run.

use crate::error::{EngineError, Result};
use crate::payload::PayloadType;
use crate::queue::OverflowPolicy;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tbload_core::{ConnectionMode, DeviceId};

/// Complete description of one load test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    /// Direct devices or gateway multiplexing
    #[serde(default)]
    pub mode: ConnectionMode,

    /// Simulated device index range
    #[serde(default = "default_devices")]
    pub devices: DeviceRange,

    /// Gateway index range (gateway mode only)
    #[serde(default = "default_gateways")]
    pub gateways: DeviceRange,

    /// Profile name announced for child devices in gateway connect envelopes
    #[serde(default = "default_device_profile")]
    pub device_profile: String,

    /// Steady-state run length in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Telemetry payload strategy
    #[serde(default)]
    pub payload: PayloadType,

    /// Alarm-flagged payloads per second (0 disables injection)
    #[serde(default)]
    pub alarm_rate: f64,

    /// Seed for run-level jitter (backoff, warmup pauses)
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub rate: RateConfig,

    #[serde(default)]
    pub lifecycle: LifecycleFlags,

    #[serde(default)]
    pub special_devices: SpecialDevices,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub connect: ConnectConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub timeouts: PhaseTimeouts,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub rest: RestConfig,
}

fn default_devices() -> DeviceRange {
    DeviceRange::new("DW", 0, 100)
}

fn default_gateways() -> DeviceRange {
    DeviceRange::new("GW", 0, 2)
}

fn default_device_profile() -> String {
    "ffu".to_string()
}

fn default_duration_secs() -> u64 {
    60
}

fn default_seed() -> u64 {
    42
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            devices: default_devices(),
            gateways: default_gateways(),
            device_profile: default_device_profile(),
            duration_secs: default_duration_secs(),
            payload: PayloadType::default(),
            alarm_rate: 0.0,
            seed: default_seed(),
            rate: RateConfig::default(),
            lifecycle: LifecycleFlags::default(),
            special_devices: SpecialDevices::default(),
            workers: WorkerConfig::default(),
            connect: ConnectConfig::default(),
            publish: PublishConfig::default(),
            timeouts: PhaseTimeouts::default(),
            mqtt: MqttConfig::default(),
            rest: RestConfig::default(),
        }
    }
}

impl TestPlan {
    /// Load a plan from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse a plan from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Write the default plan as YAML, for `init-config`
    pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
        let body = serde_yaml::to_string(&Self::default())?;
        let content = format!(
            "# tbload test plan\n\
             # Durations are in seconds (`*_secs`) or milliseconds (`*_ms`).\n\
             # mode: direct | gateway\n\n{}",
            body
        );
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Validate the plan before a run starts
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(invalid(format!(
                "device range {}..{} is empty",
                self.devices.start, self.devices.end
            )));
        }
        if self.devices.prefix.is_empty() {
            return Err(invalid("device prefix must not be empty"));
        }
        if !(self.rate.target_per_sec > 0.0 && self.rate.target_per_sec.is_finite()) {
            return Err(invalid("rate.target_per_sec must be a positive number"));
        }
        if !(self.rate.tolerance > 0.0 && self.rate.tolerance < 1.0) {
            return Err(invalid("rate.tolerance must be in (0, 1)"));
        }
        if self.rate.tick_ms == 0 {
            return Err(invalid("rate.tick_ms must be positive"));
        }
        if let Some(cap) = self.rate.per_client_cap {
            if !(cap > 0.0 && cap.is_finite()) {
                return Err(invalid("rate.per_client_cap must be a positive number when set"));
            }
        }
        if self.alarm_rate < 0.0 || !self.alarm_rate.is_finite() {
            return Err(invalid("alarm_rate must be a non-negative number"));
        }
        if self.mode == ConnectionMode::Gateway {
            if self.gateways.is_empty() {
                return Err(invalid("gateway mode requires a non-empty gateway range"));
            }
            if self.gateways.len() > self.devices.len() {
                return Err(invalid(format!(
                    "{} gateways cannot share {} devices",
                    self.gateways.len(),
                    self.devices.len()
                )));
            }
        }
        if self.workers.count == 0 {
            return Err(invalid("workers.count must be positive"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(invalid("workers.queue_capacity must be positive"));
        }
        if self.connect.max_attempts == 0 || self.publish.max_attempts == 0 {
            return Err(invalid("attempt limits must be at least 1"));
        }
        if self.connect.concurrency == 0 || self.connect.warmup_pack_size == 0 {
            return Err(invalid("connect.concurrency and connect.warmup_pack_size must be positive"));
        }
        self.payload.validate()?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::Config(msg.into())
}

/// Half-open index range `[start, end)` of named entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRange {
    pub prefix: String,
    pub start: u64,
    pub end: u64,
}

impl DeviceRange {
    pub fn new(prefix: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            prefix: prefix.into(),
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Ids of every entity in the range, in index order
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        (self.start..self.end).map(move |i| DeviceId::indexed(&self.prefix, i))
    }
}

/// Aggregate rate control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Target aggregate messages per second
    pub target_per_sec: f64,
    /// Accepted relative deviation of the achieved rate
    pub tolerance: f64,
    /// Maximum messages per second on a single connection
    pub per_client_cap: Option<f64>,
    /// Scheduler tick
    pub tick_ms: u64,
    /// Bucket capacity expressed as a window of the target rate
    pub burst_window_ms: u64,
    /// What to do with demand the pool cannot absorb
    pub overflow: OverflowPolicy,
    /// Progress log period during RUN
    pub progress_secs: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            target_per_sec: 100.0,
            tolerance: 0.1,
            per_client_cap: None,
            tick_ms: 10,
            burst_window_ms: 100,
            overflow: OverflowPolicy::DropOldest,
            progress_secs: 10,
        }
    }
}

impl RateConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_secs.max(1))
    }
}

/// Which lifecycle steps are enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleFlags {
    /// Create-or-find entities through the provisioning collaborator
    pub provision: bool,
    /// Send the connect burst before RUN
    pub warmup: bool,
    /// Publish static attributes once after the connect burst
    pub initial_attributes: bool,
    /// Create gateway -> device relations (gateway mode, provisioning on)
    pub relations: bool,
    /// Delete provisioned entities during CLEANUP
    pub delete_on_complete: bool,
}

impl Default for LifecycleFlags {
    fn default() -> Self {
        Self {
            provision: true,
            warmup: true,
            initial_attributes: true,
            relations: true,
            delete_on_complete: false,
        }
    }
}

/// Static allow-lists of special devices, by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialDevices {
    pub alarm: Vec<String>,
    pub offline: Vec<String>,
    pub stopped: Vec<String>,
    pub vibration_warning: Vec<String>,
}

impl Default for SpecialDevices {
    fn default() -> Self {
        let names = |idx: &[u64]| idx.iter().map(|i| format!("DW{:08}", i)).collect();
        Self {
            alarm: names(&[15, 32, 47]),
            offline: names(&[12, 29, 56]),
            stopped: names(&[8, 23, 41]),
            vibration_warning: names(&[22, 38, 51]),
        }
    }
}

impl SpecialDevices {
    pub fn none() -> Self {
        Self {
            alarm: Vec::new(),
            offline: Vec::new(),
            stopped: Vec::new(),
            vibration_warning: Vec::new(),
        }
    }
}

/// Publish worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of publish workers, independent of the device count
    pub count: usize,
    /// Bounded queue length per worker
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 8,
            queue_capacity: 1024,
        }
    }
}

/// Jitter applied to every retry interval: a delay `d` becomes uniform in
/// `[d * (1 - f), d * (1 + f)]`.
const RETRY_RANDOMIZATION: f64 = 0.5;
const RETRY_MULTIPLIER: f64 = 2.0;

/// Connection setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Stop retrying a client once this much time has passed since its
    /// first attempt, even with attempts left
    pub backoff_max_elapsed_secs: Option<u64>,
    /// Connections opened in parallel
    pub concurrency: usize,
    /// Fewer connected clients than this fails the run
    pub min_clients: usize,
    /// Connect envelopes per warmup pack
    pub warmup_pack_size: usize,
    /// Base pause between warmup packs (a random 0..base is added)
    pub warmup_pack_pause_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            backoff_max_elapsed_secs: Some(120),
            concurrency: 64,
            min_clients: 1,
            warmup_pack_size: 100,
            warmup_pack_pause_ms: 100,
        }
    }
}

impl ConnectConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Fresh retry schedule for one client (or one provisioning pass).
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff_base())
            .with_randomization_factor(RETRY_RANDOMIZATION)
            .with_multiplier(RETRY_MULTIPLIER)
            .with_max_interval(self.backoff_max())
            .with_max_elapsed_time(self.backoff_max_elapsed_secs.map(Duration::from_secs))
            .build()
    }

    pub fn warmup_pack_pause(&self) -> Duration {
        Duration::from_millis(self.warmup_pack_pause_ms)
    }
}

/// Per-task publish behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Total attempts per task, including the first
    pub max_attempts: u32,
    /// Bound on waiting for the broker's acknowledgement
    pub timeout_ms: u64,
    /// Delay before the first retry (grows exponentially, with jitter)
    pub retry_delay_ms: u64,
    /// Upper bound on a single retry delay
    pub retry_delay_max_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 5_000,
            retry_delay_ms: 50,
            retry_delay_max_ms: 2_000,
        }
    }
}

impl PublishConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_delay_max(&self) -> Duration {
        Duration::from_millis(self.retry_delay_max_ms)
    }

    /// Fresh retry schedule for one publish task. Attempts bound it, not
    /// elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_delay())
            .with_randomization_factor(RETRY_RANDOMIZATION)
            .with_multiplier(RETRY_MULTIPLIER)
            .with_max_interval(self.retry_delay_max().max(self.retry_delay()))
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Per-phase time limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub provision_secs: u64,
    /// Bounded provisioning retries before the run fails
    pub provision_retries: u32,
    pub warmup_secs: u64,
    /// Allowance beyond `duration_secs` for draining in-flight tasks
    pub run_grace_secs: u64,
    pub cleanup_secs: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            provision_secs: 300,
            provision_retries: 1,
            warmup_secs: 120,
            run_grace_secs: 30,
            cleanup_secs: 120,
        }
    }
}

impl PhaseTimeouts {
    pub fn provision(&self) -> Duration {
        Duration::from_secs(self.provision_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn run(&self, duration: Duration) -> Duration {
        duration + Duration::from_secs(self.run_grace_secs)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }
}

/// MQTT transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Request channel capacity of each client
    pub channel_capacity: usize,
    pub connect_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            channel_capacity: 1024,
            connect_timeout_secs: 10,
        }
    }
}

/// REST provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            username: "tenant@thingsboard.org".to_string(),
            password: "tenant".to_string(),
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_valid() {
        let plan = TestPlan::default();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.devices.len(), 100);
        assert_eq!(plan.duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_device_range_ids() {
        let range = DeviceRange::new("DW", 8, 11);
        let ids: Vec<String> = range.ids().map(|d| d.to_string()).collect();
        assert_eq!(ids, vec!["DW00000008", "DW00000009", "DW00000010"]);

        assert!(DeviceRange::new("DW", 5, 5).is_empty());
        assert_eq!(DeviceRange::new("DW", 5, 2).len(), 0);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
mode: gateway
devices: { prefix: DW, start: 0, end: 60 }
gateways: { prefix: GW, start: 0, end: 2 }
duration_secs: 10
alarm_rate: 2.0
rate:
  target_per_sec: 50
  overflow: block
"#;
        let plan = TestPlan::from_yaml(yaml).unwrap();
        assert_eq!(plan.mode, ConnectionMode::Gateway);
        assert_eq!(plan.devices.len(), 60);
        assert_eq!(plan.rate.target_per_sec, 50.0);
        assert_eq!(plan.rate.overflow, OverflowPolicy::Block);
        // untouched sections keep their defaults
        assert_eq!(plan.workers.count, 8);
        assert!(plan.lifecycle.warmup);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut plan = TestPlan::default();
        plan.devices = DeviceRange::new("DW", 10, 10);
        assert!(plan.validate().is_err());

        let mut plan = TestPlan::default();
        plan.rate.target_per_sec = 0.0;
        assert!(plan.validate().is_err());

        let mut plan = TestPlan::default();
        plan.rate.tolerance = 1.5;
        assert!(plan.validate().is_err());

        let mut plan = TestPlan::default();
        plan.mode = ConnectionMode::Gateway;
        plan.gateways = DeviceRange::new("GW", 0, 0);
        assert!(plan.validate().is_err());

        let mut plan = TestPlan::default();
        plan.workers.queue_capacity = 0;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_non_finite_rates_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut plan = TestPlan::default();
            plan.rate.target_per_sec = bad;
            assert!(plan.validate().is_err(), "target_per_sec {bad}");

            let mut plan = TestPlan::default();
            plan.alarm_rate = bad;
            assert!(plan.validate().is_err(), "alarm_rate {bad}");

            let mut plan = TestPlan::default();
            plan.rate.per_client_cap = Some(bad);
            assert!(plan.validate().is_err(), "per_client_cap {bad}");
        }
    }

    #[test]
    fn test_connect_backoff_is_jittered_and_capped() {
        use backoff::backoff::Backoff;

        let config = ConnectConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            backoff_max_elapsed_secs: None,
            ..ConnectConfig::default()
        };
        let mut backoff = config.backoff();

        let first = backoff.next_backoff().unwrap();
        assert!(
            first >= Duration::from_millis(50) && first <= Duration::from_millis(151),
            "{first:?}"
        );
        for _ in 0..20 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_millis(1_501), "{delay:?}");
        }
        // once the interval has saturated, the jitter floor is half the cap
        let late = backoff.next_backoff().unwrap();
        assert!(late >= Duration::from_millis(500), "{late:?}");
    }

    #[test]
    fn test_publish_backoff_never_gives_up_on_time() {
        use backoff::backoff::Backoff;

        let config = PublishConfig {
            retry_delay_ms: 10,
            retry_delay_max_ms: 40,
            ..PublishConfig::default()
        };
        let mut backoff = config.backoff();
        for _ in 0..50 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_millis(61), "{delay:?}");
        }
    }

    #[test]
    fn test_write_default_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");

        TestPlan::write_default(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# tbload test plan"));

        let plan = TestPlan::from_file(&path).unwrap();
        assert_eq!(plan.devices, TestPlan::default().devices);
        assert_eq!(plan.special_devices.offline.len(), 3);
        assert!(plan.validate().is_ok());
    }
}
