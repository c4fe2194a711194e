//! Payload generator registry.
//!
//! A strategy is picked once per run from the plan's `PayloadType`. Every
//! generated value is a pure function of the device name (through its stable
//! seed), its static category, the alarm flag and the timestamp, so concurrent
//! workers never share generator state.

use crate::error::{EngineError, Result};
use crate::fleet::Classifier;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tbload_core::{compute_device_seed, DeviceCategory, DeviceId, DeviceSeed, EpochMillis};

/// Flat key/value map carried in telemetry and attribute envelopes
pub type Values = Map<String, Value>;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Payload strategy selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadType {
    /// Temperature/humidity for smoke tests
    Default,
    /// Fan filter unit telemetry
    Ffu(FfuProfile),
    /// Data points declared in the plan
    Configured(ConfiguredProfile),
}

impl Default for PayloadType {
    fn default() -> Self {
        PayloadType::Ffu(FfuProfile::default())
    }
}

impl PayloadType {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadType::Default => "default",
            PayloadType::Ffu(_) => "ffu",
            PayloadType::Configured(_) => "configured",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PayloadType::Default => Ok(()),
            PayloadType::Ffu(profile) => {
                if profile.rated_speed <= 0 || profile.min_speed > profile.max_speed {
                    return Err(EngineError::Config("invalid FFU speed range".to_string()));
                }
                Ok(())
            }
            PayloadType::Configured(profile) => {
                if profile.data_points.is_empty() {
                    return Err(EngineError::Config(
                        "configured payload needs at least one data point".to_string(),
                    ));
                }
                for (name, point) in &profile.data_points {
                    point.validate(name)?;
                }
                if !profile.data_points.values().any(DataPoint::alarm_capable) {
                    return Err(EngineError::Config(
                        "configured payload needs a data point with an alarm_value or a min/max range"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Electrical and mechanical ratings of the simulated fan filter units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfuProfile {
    pub min_speed: i64,
    pub max_speed: i64,
    pub rated_speed: i64,
    /// Airflow at rated speed, m3/h
    pub max_airflow: i64,
    pub rated_voltage: f64,
    pub rated_current: f64,
    pub rated_power: i64,
    /// Differential pressure alarm threshold, Pa
    pub pressure_alarm: i64,
    pub motor_temp_derating: i64,
    pub motor_temp_shutdown: i64,
    /// Alarm devices whose fault is motor overheating; other alarm devices
    /// report a clogged filter
    pub overheat_devices: Vec<String>,
}

impl Default for FfuProfile {
    fn default() -> Self {
        Self {
            min_speed: 500,
            max_speed: 2000,
            rated_speed: 1800,
            max_airflow: 2330,
            rated_voltage: 400.0,
            rated_current: 4.5,
            rated_power: 1500,
            pressure_alarm: 450,
            motor_temp_derating: 75,
            motor_temp_shutdown: 85,
            overheat_devices: vec!["DW00000032".to_string()],
        }
    }
}

/// Plan-declared telemetry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredProfile {
    pub data_points: BTreeMap<String, DataPoint>,
    /// Values merged over generated telemetry, by special category
    pub overrides: CategoryOverrides,
    /// Static attributes published once per device
    pub attributes: Values,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryOverrides {
    pub alarm: Values,
    pub stopped: Values,
    pub vibration_warning: Values,
}

/// One configured telemetry key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPoint {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub default: Option<Value>,
    /// Relative spread around `default`
    pub variance: Option<f64>,
    /// Discrete choices
    pub values: Vec<Value>,
    /// Weights for `values`, same length
    pub probabilities: Vec<f64>,
    pub unit: Option<String>,
    /// Value reported when the payload is alarm-flagged
    pub alarm_value: Option<Value>,
}

impl DataPoint {
    fn validate(&self, name: &str) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(EngineError::Config(format!(
                    "data point {}: min {} exceeds max {}",
                    name, min, max
                )));
            }
        }
        if !self.probabilities.is_empty() && self.probabilities.len() != self.values.len() {
            return Err(EngineError::Config(format!(
                "data point {}: {} probabilities for {} values",
                name,
                self.probabilities.len(),
                self.values.len()
            )));
        }
        if self.values.is_empty() && self.default.is_none() && (self.min.is_none() || self.max.is_none()) {
            return Err(EngineError::Config(format!(
                "data point {} needs values, a min/max range or a default",
                name
            )));
        }
        if let Some(alarm) = &self.alarm_value {
            let in_range = match (alarm.as_f64(), self.min, self.max) {
                (Some(v), Some(min), Some(max)) => (min..=max).contains(&v),
                _ => false,
            };
            if in_range || self.values.contains(alarm) || self.default.as_ref() == Some(alarm) {
                return Err(EngineError::Config(format!(
                    "data point {}: alarm_value {} is a normal value",
                    name, alarm
                )));
            }
        }
        Ok(())
    }

    /// Whether an alarm-flagged payload can push this point out of range.
    fn alarm_capable(&self) -> bool {
        self.alarm_value.is_some() || (self.min.is_some() && self.max.is_some())
    }

    fn generate(&self, rng: &mut StdRng) -> Option<Value> {
        if !self.values.is_empty() {
            let index = match WeightedIndex::new(&self.probabilities) {
                Ok(dist) if self.probabilities.len() == self.values.len() => dist.sample(rng),
                _ => rng.gen_range(0..self.values.len()),
            };
            return self.values.get(index).cloned();
        }

        if let (Some(min), Some(max)) = (self.min, self.max) {
            let value = match (self.variance, self.default.as_ref().and_then(Value::as_f64)) {
                (Some(variance), Some(default)) => {
                    // sum of two uniforms approximates a bell around the default
                    let spread = (rng.gen::<f64>() - rng.gen::<f64>()) * variance * default;
                    (default + spread).clamp(min, max)
                }
                _ if max > min => rng.gen_range(min..max),
                _ => min,
            };
            return Some(self.rounded(value));
        }

        self.default.clone()
    }

    fn rounded(&self, value: f64) -> Value {
        match self.unit.as_deref() {
            Some(unit) if unit.contains("mm/s") => Value::from(round_to(value, 1)),
            _ => Value::from(value.round() as i64),
        }
    }

    /// A value clearly outside the configured range
    fn out_of_range(&self) -> Option<Value> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some(self.rounded(max + (max - min).max(1.0))),
            _ => None,
        }
    }
}

/// Fault reported by a permanently alarming FFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfuFault {
    MotorOverheat,
    FilterClogged,
}

impl FfuFault {
    pub fn error_code(&self) -> i64 {
        match self {
            FfuFault::MotorOverheat => 101,
            FfuFault::FilterClogged => 201,
        }
    }
}

const WARNING_HIGH_TEMPERATURE: i64 = 301;
const WARNING_FILTER_MAINTENANCE: i64 = 302;
const WARNING_VIBRATION: i64 = 402;

const FAN_MODELS: &[&str] = &[
    "R3G355-AS03-01",
    "R3G310-AP09-01",
    "R3G400-AP30-01",
    "R2E250-AE52-05",
    "R2E220-AA06-17",
];

const FILTER_TYPES: &[&str] = &["HEPA H13", "HEPA H14", "ULPA U15", "ULPA U16"];

const GATEWAY_MODELS: &[&str] = &["TB-GW-100", "TB-GW-200", "TB-GW-300"];

/// Payload registry resolved once per run.
#[derive(Debug, Clone)]
pub struct PayloadRegistry {
    payload: PayloadType,
    classifier: Classifier,
}

impl PayloadRegistry {
    pub fn new(payload: PayloadType, classifier: Classifier) -> Self {
        Self {
            payload,
            classifier,
        }
    }

    pub fn payload_type(&self) -> &PayloadType {
        &self.payload
    }

    pub fn category(&self, device: &DeviceId) -> DeviceCategory {
        self.classifier.classify(device)
    }

    /// Telemetry values for `device` at `ts_ms`.
    pub fn generate(&self, device: &DeviceId, alarm: bool, ts_ms: EpochMillis) -> Values {
        let seed = device.seed();
        let category = self.category(device);
        let mut rng = StdRng::seed_from_u64(tick_seed(seed, ts_ms));

        match &self.payload {
            PayloadType::Default => default_telemetry(seed, alarm, &mut rng),
            PayloadType::Ffu(profile) => {
                ffu_telemetry(profile, device, seed, category, alarm, ts_ms, &mut rng)
            }
            PayloadType::Configured(profile) => {
                configured_telemetry(profile, seed, category, alarm, ts_ms)
            }
        }
    }

    /// Static attributes of `device`, stable across runs.
    pub fn attributes(&self, device: &DeviceId, now_ms: EpochMillis) -> Values {
        let mut rng = StdRng::seed_from_u64(device.seed());
        match &self.payload {
            PayloadType::Default => {
                let mut values = Values::new();
                put(&mut values, "model", "sim-sensor");
                put(&mut values, "firmwareVersion", format!("1.{}", rng.gen_range(0..10)));
                values
            }
            PayloadType::Ffu(profile) => ffu_attributes(profile, &mut rng, now_ms),
            PayloadType::Configured(profile) => profile.attributes.clone(),
        }
    }

    /// Attributes a gateway publishes about itself.
    pub fn gateway_attributes(&self, gateway: &DeviceId, now_ms: EpochMillis) -> Values {
        let mut rng = StdRng::seed_from_u64(gateway.seed());
        let mut values = Values::new();

        put(&mut values, "manufacturer", "ThingsBoard");
        put(&mut values, "gw_model", pick(GATEWAY_MODELS, &mut rng));
        put(
            &mut values,
            "firmware_version",
            format!("GW-{}.{}", rng.gen_range(2..4), rng.gen_range(0..10)),
        );
        put(
            &mut values,
            "serial_number",
            format!("GW-{:04}-{:06}", rng.gen_range(0..10_000), rng.gen_range(0..1_000_000)),
        );
        put(
            &mut values,
            "mac_address",
            format!(
                "DC:A6:32:{:02X}:{:02X}:{:02X}",
                rng.gen::<u8>(),
                rng.gen::<u8>(),
                rng.gen::<u8>()
            ),
        );
        put(&mut values, "ip_address", format!("192.168.1.{}", rng.gen_range(100..=200)));
        put(&mut values, "protocol", "MQTT");
        put(&mut values, "port", 1883);
        put(&mut values, "max_devices", 100);
        let installed = now_ms - rng.gen_range(0..365) * DAY_MS;
        put(&mut values, "installation_date", installed);
        put(&mut values, "commissioning_date", installed + DAY_MS);
        values
    }

    fn fault_of(profile: &FfuProfile, device: &DeviceId) -> FfuFault {
        if profile.overheat_devices.iter().any(|d| d == device.as_str()) {
            FfuFault::MotorOverheat
        } else {
            FfuFault::FilterClogged
        }
    }
}

/// Seed for the per-message RNG: device seed mixed with the timestamp.
fn tick_seed(seed: DeviceSeed, ts_ms: EpochMillis) -> u64 {
    seed ^ (ts_ms as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn put(values: &mut Values, key: &str, value: impl Into<Value>) {
    values.insert(key.to_string(), value.into());
}

fn pick<'a>(choices: &[&'a str], rng: &mut StdRng) -> &'a str {
    choices[rng.gen_range(0..choices.len())]
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn default_telemetry(seed: DeviceSeed, alarm: bool, rng: &mut StdRng) -> Values {
    let base = 20.0 + (seed % 50) as f64 / 10.0;
    let temperature = if alarm {
        rng.gen_range(80.0..100.0)
    } else {
        base + rng.gen_range(-1.0..1.0)
    };

    let mut values = Values::new();
    put(&mut values, "temperature", round_to(temperature, 1));
    put(&mut values, "humidity", round_to(rng.gen_range(40.0..60.0), 1));
    values
}

fn ffu_telemetry(
    profile: &FfuProfile,
    device: &DeviceId,
    seed: DeviceSeed,
    category: DeviceCategory,
    alarm: bool,
    ts_ms: EpochMillis,
    rng: &mut StdRng,
) -> Values {
    // per-device constants
    let mut persistent = StdRng::seed_from_u64(seed);
    let speed_setpoint: i64 = 1300 + persistent.gen_range(0..500);
    let ambient: i64 = 22 + persistent.gen_range(0..8);
    let filter_clogging: i64 = persistent.gen_range(0..80);
    let base_hours: i64 = persistent.gen_range(0..30_000);

    let stopped = category == DeviceCategory::Stopped;
    let alarming = category == DeviceCategory::Alarm;
    let fault = PayloadRegistry::fault_of(profile, device);

    let actual_speed = if stopped {
        0
    } else {
        speed_setpoint + rng.gen_range(-10..10)
    };
    let speed_ratio = actual_speed as f64 / profile.rated_speed as f64;
    let airflow = (profile.max_airflow as f64 * speed_ratio) as i64;

    let voltage = profile.rated_voltage + rng.gen_range(-10.0..10.0);
    let load_factor = speed_ratio * (0.7 + rng.gen::<f64>() * 0.3);
    let current = profile.rated_current * load_factor;
    let power = (voltage * current * 0.9) as i64;

    let differential_pressure = if stopped {
        rng.gen_range(0..20)
    } else if alarming && fault == FfuFault::FilterClogged {
        profile.pressure_alarm + rng.gen_range(0..50)
    } else {
        (100.0 + speed_ratio * 150.0) as i64 + filter_clogging + rng.gen_range(0..20)
    };

    let mut motor_temperature = if stopped {
        ambient + rng.gen_range(0..10)
    } else if alarming && fault == FfuFault::MotorOverheat {
        profile.motor_temp_derating + rng.gen_range(0..10)
    } else {
        ambient + (load_factor * 25.0) as i64 + rng.gen_range(0..5)
    };

    let (mut status, mut error_code, mut warning_code) = if stopped {
        ("STOPPED", 0, 0)
    } else if alarming {
        let status = if fault == FfuFault::MotorOverheat
            && motor_temperature >= profile.motor_temp_shutdown
        {
            "FAULT"
        } else {
            "ALARM"
        };
        (status, fault.error_code(), 0)
    } else {
        let mut warning = 0;
        if differential_pressure > 350 {
            warning = WARNING_FILTER_MAINTENANCE;
        }
        if motor_temperature > 65 {
            warning = WARNING_HIGH_TEMPERATURE;
        }
        ("RUNNING", 0, warning)
    };

    let (harmonic, rms) = if stopped {
        (0.0, 0.0)
    } else if alarming {
        (6.0 + rng.gen::<f64>() * 1.5, 7.5 + rng.gen::<f64>() * 3.0)
    } else if category == DeviceCategory::VibrationWarning {
        if warning_code == 0 {
            warning_code = WARNING_VIBRATION;
        }
        (3.8 + rng.gen::<f64>() * 0.8, 6.2 + rng.gen::<f64>() * 1.2)
    } else {
        let harmonic = (0.8 + speed_ratio * 1.5) * load_factor + (rng.gen::<f64>() * 0.3 - 0.15);
        let rms = (1.5 + speed_ratio * 2.0) * load_factor + (rng.gen::<f64>() * 0.5 - 0.25);
        (harmonic.clamp(0.1, 3.5), rms.clamp(0.5, 5.5))
    };

    // injected alarm: motor temperature beyond the shutdown limit
    if alarm {
        motor_temperature = profile.motor_temp_shutdown + rng.gen_range(1..10);
        status = "FAULT";
        if error_code == 0 {
            error_code = FfuFault::MotorOverheat.error_code();
        }
    }

    let mut values = Values::new();
    put(&mut values, "RPM", actual_speed);
    put(&mut values, "speedSetpoint", speed_setpoint);
    put(&mut values, "airSpeed", airflow);
    put(&mut values, "dcLinkVoltage", round_to(voltage, 1));
    put(&mut values, "dcLinkCurrent", round_to(current, 2));
    put(&mut values, "energy_consumption", power);
    put(&mut values, "ambientTemperature", ambient);
    put(&mut values, "differentialPressure", differential_pressure);
    put(&mut values, "pressureSetpoint", 250);
    put(&mut values, "motorTemperature", motor_temperature);
    put(&mut values, "motorTempDerating", profile.motor_temp_derating);
    put(&mut values, "motorTempShutdown", profile.motor_temp_shutdown);
    put(&mut values, "operatingHours", base_hours + (ts_ms / 3_600_000) % 20_000);
    put(&mut values, "controlMode", 1);
    put(&mut values, "operating_status", status);
    put(&mut values, "error_code", error_code);
    put(&mut values, "warning_code", warning_code);
    put(&mut values, "Vibration_5th_harmonic_sum", round_to(harmonic, 2));
    put(&mut values, "Vibration_RMS_sum", round_to(rms, 2));
    put(
        &mut values,
        "speedActualPercent",
        actual_speed * 100 / profile.rated_speed,
    );
    put(
        &mut values,
        "speedSetpointPercent",
        speed_setpoint * 100 / profile.rated_speed,
    );
    put(&mut values, "modbusStatus", "OK");
    put(&mut values, "communicationErrors", rng.gen_range(0..5));
    values
}

fn ffu_attributes(profile: &FfuProfile, rng: &mut StdRng, now_ms: EpochMillis) -> Values {
    let model = pick(FAN_MODELS, rng);
    let diameter: i64 = model.get(3..6).and_then(|d| d.parse().ok()).unwrap_or(355);
    let installed = now_ms - rng.gen_range(0..730) * DAY_MS;
    let filter_installed = now_ms - rng.gen_range(0..365) * DAY_MS;

    let mut values = Values::new();
    put(&mut values, "fanModel", model);
    put(&mut values, "manufacturer", "ebm-papst");
    put(
        &mut values,
        "firmwareVersion",
        format!("ACE-{}.{}", rng.gen_range(3..5), rng.gen_range(0..10)),
    );
    put(&mut values, "fanDiameter", diameter);
    put(
        &mut values,
        "serialNumber",
        format!("EBM-{:04}-{:06}", rng.gen_range(0..10_000), rng.gen_range(0..1_000_000)),
    );
    put(&mut values, "modbusAddress", rng.gen_range(1..=247));
    put(&mut values, "modbusBaudRate", 19200);
    put(&mut values, "modbusProtocol", "RTU");
    put(&mut values, "installationDate", installed);
    put(&mut values, "commissioningDate", installed + 7 * DAY_MS);
    put(&mut values, "filterType", pick(FILTER_TYPES, rng));
    put(&mut values, "filterInstallDate", filter_installed);
    put(&mut values, "filterChangeInterval", 8760);
    put(&mut values, "ratedSpeed", profile.rated_speed);
    put(&mut values, "maxSpeed", profile.max_speed);
    put(&mut values, "minSpeed", profile.min_speed);
    put(&mut values, "ratedAirflow", profile.max_airflow);
    put(&mut values, "ratedPower", profile.rated_power);
    put(&mut values, "nominalPower", 1050 + rng.gen_range(0..150));
    put(&mut values, "ratedVoltage", profile.rated_voltage);
    put(&mut values, "ratedCurrent", profile.rated_current);
    put(&mut values, "efficiency", round_to(0.52 + rng.gen::<f64>() * 0.08, 2));
    put(&mut values, "cleanroomClass", format!("ISO {}", rng.gen_range(4..8)));
    put(&mut values, "maintenanceInterval", 8760);
    put(&mut values, "nextMaintenanceDue", now_ms + 180 * DAY_MS);
    put(&mut values, "warrantyExpiry", installed + 3 * 365 * DAY_MS);
    values
}

fn configured_telemetry(
    profile: &ConfiguredProfile,
    seed: DeviceSeed,
    category: DeviceCategory,
    alarm: bool,
    ts_ms: EpochMillis,
) -> Values {
    let mut values = Values::new();
    for (name, point) in &profile.data_points {
        let point_seed = seed ^ compute_device_seed(name);
        let mut rng = StdRng::seed_from_u64(tick_seed(point_seed, ts_ms));
        if let Some(value) = point.generate(&mut rng) {
            values.insert(name.clone(), value);
        }
    }

    let overrides = match category {
        DeviceCategory::Alarm => Some(&profile.overrides.alarm),
        DeviceCategory::Stopped => Some(&profile.overrides.stopped),
        DeviceCategory::VibrationWarning => Some(&profile.overrides.vibration_warning),
        DeviceCategory::Normal | DeviceCategory::Offline => None,
    };
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            values.insert(key.clone(), value.clone());
        }
    }

    if alarm {
        let mut injected = false;
        for (name, point) in &profile.data_points {
            if let Some(value) = &point.alarm_value {
                values.insert(name.clone(), value.clone());
                injected = true;
            }
        }
        if !injected {
            if let Some((name, value)) = profile
                .data_points
                .iter()
                .find_map(|(name, point)| point.out_of_range().map(|v| (name, v)))
            {
                values.insert(name.clone(), value);
            }
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpecialDevices;

    const TS: EpochMillis = 1_700_000_000_000;

    fn ffu_registry() -> PayloadRegistry {
        PayloadRegistry::new(
            PayloadType::Ffu(FfuProfile::default()),
            Classifier::new(&SpecialDevices::default()),
        )
    }

    fn int(values: &Values, key: &str) -> i64 {
        values[key].as_i64().unwrap()
    }

    #[test]
    fn test_generation_is_deterministic() {
        let registry = ffu_registry();
        let device = DeviceId::indexed("DW", 3);

        assert_eq!(
            registry.generate(&device, false, TS),
            registry.generate(&device, false, TS)
        );
        assert_eq!(registry.attributes(&device, TS), registry.attributes(&device, TS));

        // persistent per-device values survive across timestamps
        let a = registry.generate(&device, false, TS);
        let b = registry.generate(&device, false, TS + 10_000);
        assert_eq!(a["speedSetpoint"], b["speedSetpoint"]);
        assert_eq!(a["ambientTemperature"], b["ambientTemperature"]);
    }

    #[test]
    fn test_stopped_device() {
        let registry = ffu_registry();
        let values = registry.generate(&DeviceId::indexed("DW", 8), false, TS);

        assert_eq!(int(&values, "RPM"), 0);
        assert_eq!(values["operating_status"], "STOPPED");
        assert_eq!(values["Vibration_RMS_sum"].as_f64(), Some(0.0));
    }

    #[test]
    fn test_alarm_devices_report_fault_codes() {
        let registry = ffu_registry();

        let overheat = registry.generate(&DeviceId::indexed("DW", 32), false, TS);
        assert_eq!(int(&overheat, "error_code"), 101);
        assert!(int(&overheat, "motorTemperature") >= 75);

        let clogged = registry.generate(&DeviceId::indexed("DW", 15), false, TS);
        assert_eq!(int(&clogged, "error_code"), 201);
        assert_eq!(clogged["operating_status"], "ALARM");
        assert!(int(&clogged, "differentialPressure") >= 450);
    }

    #[test]
    fn test_vibration_warning_device() {
        let registry = ffu_registry();
        let values = registry.generate(&DeviceId::indexed("DW", 22), false, TS);

        assert_eq!(values["operating_status"], "RUNNING");
        assert!(values["Vibration_RMS_sum"].as_f64().unwrap() >= 6.2);
        let warning = int(&values, "warning_code");
        assert!(warning == 402 || warning == 301 || warning == 302);
    }

    #[test]
    fn test_alarm_flag_forces_out_of_range_value() {
        let registry = ffu_registry();
        for i in [1, 2, 8, 15] {
            let values = registry.generate(&DeviceId::indexed("DW", i), true, TS);
            assert!(int(&values, "motorTemperature") > 85);
            assert_eq!(values["operating_status"], "FAULT");
            assert_ne!(int(&values, "error_code"), 0);
        }

        let default = PayloadRegistry::new(PayloadType::Default, Classifier::default());
        let values = default.generate(&DeviceId::indexed("DW", 1), true, TS);
        assert!(values["temperature"].as_f64().unwrap() >= 80.0);
    }

    #[test]
    fn test_configured_payload() {
        let yaml = r#"
type: configured
data_points:
  RPM: { min: 1000, max: 1800, unit: RPM }
  Vibration_RMS_sum: { min: 0.5, max: 5.0, unit: mm/s }
  operating_status: { values: [RUNNING, IDLE], probabilities: [1.0, 0.0] }
  controlMode: { default: 1 }
overrides:
  stopped: { RPM: 0, operating_status: STOPPED }
attributes:
  manufacturer: ebm-papst
"#;
        let payload: PayloadType = serde_yaml::from_str(yaml).unwrap();
        assert!(payload.validate().is_ok());

        let registry = PayloadRegistry::new(payload, Classifier::new(&SpecialDevices::default()));

        let normal = registry.generate(&DeviceId::indexed("DW", 1), false, TS);
        let rpm = int(&normal, "RPM");
        assert!((1000..=1800).contains(&rpm));
        assert_eq!(normal["operating_status"], "RUNNING");
        assert_eq!(int(&normal, "controlMode"), 1);

        let stopped = registry.generate(&DeviceId::indexed("DW", 8), false, TS);
        assert_eq!(int(&stopped, "RPM"), 0);
        assert_eq!(stopped["operating_status"], "STOPPED");

        let alarmed = registry.generate(&DeviceId::indexed("DW", 1), true, TS);
        assert!(int(&alarmed, "RPM") > 1800);

        let attrs = registry.attributes(&DeviceId::indexed("DW", 1), TS);
        assert_eq!(attrs["manufacturer"], "ebm-papst");
    }

    #[test]
    fn test_invalid_configured_payload() {
        let mut profile = ConfiguredProfile::default();
        assert!(PayloadType::Configured(profile.clone()).validate().is_err());

        profile.data_points.insert(
            "x".to_string(),
            DataPoint {
                min: Some(10.0),
                max: Some(1.0),
                ..Default::default()
            },
        );
        assert!(PayloadType::Configured(profile).validate().is_err());
    }

    #[test]
    fn test_configured_payload_must_be_able_to_alarm() {
        let status = |alarm_value: Option<Value>| DataPoint {
            values: vec![Value::from("RUN"), Value::from("IDLE")],
            alarm_value,
            ..Default::default()
        };

        let mut profile = ConfiguredProfile::default();
        profile.data_points.insert("status".to_string(), status(None));
        assert!(PayloadType::Configured(profile.clone()).validate().is_err());

        profile
            .data_points
            .insert("status".to_string(), status(Some(Value::from("RUN"))));
        assert!(PayloadType::Configured(profile.clone()).validate().is_err());

        profile
            .data_points
            .insert("status".to_string(), status(Some(Value::from("FAULT"))));
        let payload = PayloadType::Configured(profile);
        assert!(payload.validate().is_ok());

        let registry = PayloadRegistry::new(payload, Classifier::new(&SpecialDevices::none()));
        let device = DeviceId::indexed("DW", 1);
        let normal = registry.generate(&device, false, TS);
        let alarmed = registry.generate(&device, true, TS);
        assert_ne!(normal, alarmed);
        assert_eq!(alarmed["status"], "FAULT");
    }

    #[test]
    fn test_alarm_value_inside_range_is_rejected() {
        let mut profile = ConfiguredProfile::default();
        profile.data_points.insert(
            "RPM".to_string(),
            DataPoint {
                min: Some(1000.0),
                max: Some(1800.0),
                alarm_value: Some(Value::from(1500)),
                ..Default::default()
            },
        );
        assert!(PayloadType::Configured(profile.clone()).validate().is_err());

        if let Some(point) = profile.data_points.get_mut("RPM") {
            point.alarm_value = Some(Value::from(2500));
        }
        assert!(PayloadType::Configured(profile).validate().is_ok());
    }

    #[test]
    fn test_gateway_attributes() {
        let registry = ffu_registry();
        let gateway = DeviceId::indexed("GW", 0);
        let attrs = registry.gateway_attributes(&gateway, TS);

        assert_eq!(attrs["protocol"], "MQTT");
        assert_eq!(attrs, registry.gateway_attributes(&gateway, TS));
    }
}
