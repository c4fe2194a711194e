//! Simulated fleet layout: device names, special-device classification and
//! gateway assignment.

use crate::config::{SpecialDevices, TestPlan};
use fxhash::FxHashSet;
use std::collections::BTreeMap;
use std::ops::Range;
use tbload_core::{ClientRole, ConnectionMode, DeviceCategory, DeviceId};
use tracing::{debug, info};

/// One simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetDevice {
    pub id: DeviceId,
    pub category: DeviceCategory,
    /// Index into `Fleet::clients` of the connection carrying this device
    pub client: usize,
}

/// A connection to open: a direct device, or a gateway with its children.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    pub id: DeviceId,
    pub role: ClientRole,
    /// Child devices multiplexed over this connection (gateways only)
    pub children: Vec<DeviceId>,
}

/// Resolves device names to their special category.
///
/// Classification depends only on the name and the plan's allow-lists, so the
/// same device always lands in the same category.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    alarm: FxHashSet<String>,
    offline: FxHashSet<String>,
    stopped: FxHashSet<String>,
    vibration_warning: FxHashSet<String>,
}

impl Classifier {
    pub fn new(special: &SpecialDevices) -> Self {
        let set = |names: &[String]| names.iter().cloned().collect::<FxHashSet<_>>();
        Self {
            alarm: set(&special.alarm),
            offline: set(&special.offline),
            stopped: set(&special.stopped),
            vibration_warning: set(&special.vibration_warning),
        }
    }

    /// Offline wins over stopped, stopped over alarm, alarm over vibration.
    pub fn classify(&self, id: &DeviceId) -> DeviceCategory {
        let name = id.as_str();
        if self.offline.contains(name) {
            DeviceCategory::Offline
        } else if self.stopped.contains(name) {
            DeviceCategory::Stopped
        } else if self.alarm.contains(name) {
            DeviceCategory::Alarm
        } else if self.vibration_warning.contains(name) {
            DeviceCategory::VibrationWarning
        } else {
            DeviceCategory::Normal
        }
    }
}

/// Fleet layout for one run.
#[derive(Debug, Clone)]
pub struct Fleet {
    mode: ConnectionMode,
    devices: Vec<FleetDevice>,
    clients: Vec<ClientSpec>,
}

impl Fleet {
    /// A fleet with nothing to simulate, used when a plan is rejected.
    pub fn empty(mode: ConnectionMode) -> Self {
        Self {
            mode,
            devices: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// Build the fleet described by a plan.
    pub fn from_plan(plan: &TestPlan) -> Self {
        let classifier = Classifier::new(&plan.special_devices);
        let ids: Vec<DeviceId> = plan.devices.ids().collect();

        match plan.mode {
            ConnectionMode::Direct => {
                let clients = ids
                    .iter()
                    .map(|id| ClientSpec {
                        id: id.clone(),
                        role: ClientRole::Device,
                        children: Vec::new(),
                    })
                    .collect();
                let devices = ids
                    .into_iter()
                    .enumerate()
                    .map(|(slot, id)| FleetDevice {
                        category: classifier.classify(&id),
                        id,
                        client: slot,
                    })
                    .collect();
                Self {
                    mode: plan.mode,
                    devices,
                    clients,
                }
            }
            ConnectionMode::Gateway => {
                let gateways: Vec<DeviceId> = plan.gateways.ids().collect();
                let ranges = split_contiguous(ids.len(), gateways.len());

                let mut devices = Vec::with_capacity(ids.len());
                let mut clients = Vec::with_capacity(gateways.len());
                for (slot, (gateway, range)) in gateways.into_iter().zip(ranges).enumerate() {
                    let children = ids[range].to_vec();
                    for id in &children {
                        devices.push(FleetDevice {
                            id: id.clone(),
                            category: classifier.classify(id),
                            client: slot,
                        });
                    }
                    clients.push(ClientSpec {
                        id: gateway,
                        role: ClientRole::Gateway,
                        children,
                    });
                }
                Self {
                    mode: plan.mode,
                    devices,
                    clients,
                }
            }
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn devices(&self) -> &[FleetDevice] {
        &self.devices
    }

    pub fn clients(&self) -> &[ClientSpec] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices that take part in telemetry scheduling (offline ones never do)
    pub fn publish_targets(&self) -> impl Iterator<Item = &FleetDevice> {
        self.devices.iter().filter(|d| d.category.emits_telemetry())
    }

    pub fn category_counts(&self) -> BTreeMap<DeviceCategory, usize> {
        let mut counts = BTreeMap::new();
        for device in &self.devices {
            *counts.entry(device.category).or_insert(0) += 1;
        }
        counts
    }

    /// Log which devices each gateway carries.
    pub fn log_gateway_mapping(&self, status: &str) {
        if self.mode != ConnectionMode::Gateway {
            return;
        }

        for (slot, client) in self.clients.iter().enumerate() {
            let (first, last) = match (client.children.first(), client.children.last()) {
                (Some(first), Some(last)) => (first.as_str(), last.as_str()),
                _ => ("-", "-"),
            };
            info!(
                "Gateway {}: {} devices {} ({} .. {})",
                client.id,
                client.children.len(),
                status,
                first,
                last
            );
            for device in self.devices.iter().filter(|d| d.client == slot) {
                debug!("  {} -> {} [{}]", device.id, client.id, device.category);
            }
        }
        info!(
            "SUMMARY: {} devices mapped to {} gateways",
            self.devices.len(),
            self.clients.len()
        );
    }
}

/// Split `n` items into `parts` contiguous ranges whose sizes differ by at
/// most one; earlier ranges take the remainder.
pub fn split_contiguous(n: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = n / parts;
    let extra = n % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}
