//! Wire envelopes for direct and gateway-multiplexed devices.
//!
//! Gateway envelopes are keyed by child device name:
//! - connect: `{"device": "DW00000001", "type": "ffu"}`
//! - telemetry: `{"DW00000001": [{"ts": 1700000000000, "values": {...}}]}`
//! - attributes: `{"DW00000001": {...}}`
//!
//! Direct devices publish the bare body (`{"ts": .., "values": {..}}` or the
//! flat attribute map) on their own connection.

use crate::error::PublishError;
use crate::payload::Values;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tbload_core::{ConnectionMode, DeviceId, EnvelopeKind, EpochMillis};

const GATEWAY_CONNECT_TOPIC: &str = "v1/gateway/connect";

/// An encoded message ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub topic: &'static str,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectMessage {
    pub device: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub ts: EpochMillis,
    pub values: Values,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(value).map_err(|e| PublishError::Encode(e.to_string()))
}

fn topic_for(kind: EnvelopeKind, mode: ConnectionMode) -> &'static str {
    kind.topic(mode).unwrap_or(GATEWAY_CONNECT_TOPIC)
}

/// Gateway announcement of a child device.
pub fn connect(device: &DeviceId, device_type: &str) -> Result<Envelope, PublishError> {
    let message = ConnectMessage {
        device: device.to_string(),
        device_type: device_type.to_string(),
    };
    Ok(Envelope {
        kind: EnvelopeKind::Connect,
        topic: GATEWAY_CONNECT_TOPIC,
        payload: encode(&message)?,
    })
}

/// One telemetry sample for `device`.
pub fn telemetry(
    mode: ConnectionMode,
    device: &DeviceId,
    ts: EpochMillis,
    values: Values,
) -> Result<Envelope, PublishError> {
    let record = TelemetryRecord { ts, values };
    let payload = match mode {
        ConnectionMode::Direct => encode(&record)?,
        ConnectionMode::Gateway => {
            let mut body = BTreeMap::new();
            body.insert(device.as_str(), vec![record]);
            encode(&body)?
        }
    };
    Ok(Envelope {
        kind: EnvelopeKind::Telemetry,
        topic: topic_for(EnvelopeKind::Telemetry, mode),
        payload,
    })
}

/// Static attributes of `device`.
pub fn attributes(
    mode: ConnectionMode,
    device: &DeviceId,
    values: Values,
) -> Result<Envelope, PublishError> {
    let payload = match mode {
        ConnectionMode::Direct => encode(&values)?,
        ConnectionMode::Gateway => {
            let mut body = BTreeMap::new();
            body.insert(device.as_str(), values);
            encode(&body)?
        }
    };
    Ok(Envelope {
        kind: EnvelopeKind::Attributes,
        topic: topic_for(EnvelopeKind::Attributes, mode),
        payload,
    })
}

/// Telemetry samples carried by an envelope, as `(device, record)` pairs.
///
/// Direct envelopes carry no device name; `owner` is used instead.
pub fn decode_telemetry(
    mode: ConnectionMode,
    owner: &str,
    payload: &[u8],
) -> serde_json::Result<Vec<(String, TelemetryRecord)>> {
    match mode {
        ConnectionMode::Direct => {
            let record: TelemetryRecord = serde_json::from_slice(payload)?;
            Ok(vec![(owner.to_string(), record)])
        }
        ConnectionMode::Gateway => {
            let body: BTreeMap<String, Vec<TelemetryRecord>> = serde_json::from_slice(payload)?;
            Ok(body
                .into_iter()
                .flat_map(|(device, records)| records.into_iter().map(move |r| (device.clone(), r)))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_values() -> Values {
        let mut values = Values::new();
        values.insert("RPM".to_string(), json!(1500));
        values
    }

    #[test]
    fn test_gateway_connect_envelope() {
        let envelope = connect(&DeviceId::indexed("DW", 1), "ffu").unwrap();
        assert_eq!(envelope.topic, "v1/gateway/connect");
        assert_eq!(envelope.kind, EnvelopeKind::Connect);

        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body, json!({"device": "DW00000001", "type": "ffu"}));
    }

    #[test]
    fn test_gateway_telemetry_is_keyed_by_device() {
        let device = DeviceId::indexed("DW", 7);
        let envelope = telemetry(ConnectionMode::Gateway, &device, 1000, sample_values()).unwrap();
        assert_eq!(envelope.topic, "v1/gateway/telemetry");

        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body, json!({"DW00000007": [{"ts": 1000, "values": {"RPM": 1500}}]}));

        let decoded = decode_telemetry(ConnectionMode::Gateway, "GW00000000", &envelope.payload).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, "DW00000007");
        assert_eq!(decoded[0].1.ts, 1000);
    }

    #[test]
    fn test_direct_envelopes_are_flat() {
        let device = DeviceId::indexed("DW", 7);

        let envelope = telemetry(ConnectionMode::Direct, &device, 1000, sample_values()).unwrap();
        assert_eq!(envelope.topic, "v1/devices/me/telemetry");
        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body, json!({"ts": 1000, "values": {"RPM": 1500}}));

        let envelope = attributes(ConnectionMode::Direct, &device, sample_values()).unwrap();
        assert_eq!(envelope.topic, "v1/devices/me/attributes");
        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body, json!({"RPM": 1500}));

        let decoded = decode_telemetry(ConnectionMode::Direct, "DW00000007", b"{\"ts\":5,\"values\":{}}").unwrap();
        assert_eq!(decoded[0].0, "DW00000007");
    }

    #[test]
    fn test_gateway_attributes_envelope() {
        let device = DeviceId::indexed("DW", 2);
        let envelope = attributes(ConnectionMode::Gateway, &device, sample_values()).unwrap();
        assert_eq!(envelope.topic, "v1/gateway/attributes");

        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body, json!({"DW00000002": {"RPM": 1500}}));
    }
}
