use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EncodeError;
use crate::models::{Device, Operation, Stream};
use crate::moving_average::MovingAverager;
use crate::sensors::SensorCatalog;

/// Raw payload published on the SmartCitizen readings topic. A single
/// attribute `data` carrying an array with one reading.
#[derive(Debug, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub data: Vec<RawReading>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReading {
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub sensors: Vec<RawSensor>,
}

/// Raw sensor sample. Contains no metadata, just the id and value.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSensor {
    pub id: u32,
    pub value: Option<f64>,
}

/// Parse the raw bytes received from the broker, returning the single
/// reading they carry. Malformed JSON or an empty data array both fail with
/// `MalformedPayload`.
pub fn parse_payload(payload: &[u8]) -> Result<RawReading, EncodeError> {
    let raw: RawPayload = serde_json::from_slice(payload)
        .map_err(|e| EncodeError::MalformedPayload(e.to_string()))?;

    raw.data
        .into_iter()
        .next()
        .ok_or_else(|| EncodeError::MalformedPayload("missing data from payload".to_string()))
}

/// One enriched sensor in the outgoing document. The variant matches the
/// operation that produced it, so each serializes exactly the field set that
/// operation defines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EncodedSensor {
    #[serde(rename = "SHARE")]
    Share {
        id: u32,
        name: String,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        value: Option<f64>,
    },

    #[serde(rename = "BIN")]
    Bin {
        id: u32,
        name: String,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        bins: Vec<f64>,
        values: Vec<i64>,
    },

    #[serde(rename = "MOVING_AVG")]
    MovingAvg {
        id: u32,
        name: String,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        interval: u32,
        value: Option<f64>,
    },
}

/// The plaintext document handed to the encryptor, one per (message, stream).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub token: String,
    pub label: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub exposure: String,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
    pub sensors: Vec<EncodedSensor>,
}

/// Transformer joins a parsed reading with the device metadata and the
/// stream's declared operations to produce the document to encrypt.
pub struct Transformer {
    catalog: SensorCatalog,
    averager: Arc<dyn MovingAverager>,
}

impl Transformer {
    pub fn new(catalog: SensorCatalog, averager: Arc<dyn MovingAverager>) -> Transformer {
        Transformer { catalog, averager }
    }

    /// Build the enriched document for one stream. With no operations
    /// declared every raw sensor passes through as SHARE in payload order;
    /// otherwise the output follows the declared operation order. Sensors
    /// without catalog metadata are dropped silently either way.
    pub fn transform(
        &self,
        device: &Device,
        stream: &Stream,
        reading: &RawReading,
    ) -> Result<Document, EncodeError> {
        let mut sensors = Vec::new();

        if stream.operations.is_empty() {
            for raw in &reading.sensors {
                if let Some(info) = self.catalog.get(raw.id) {
                    sensors.push(EncodedSensor::Share {
                        id: raw.id,
                        name: info.name.clone(),
                        description: info.description.clone(),
                        unit: info.unit.clone(),
                        value: raw.value,
                    });
                }
            }
        } else {
            for operation in &stream.operations {
                let info = match self.catalog.get(operation.sensor_id()) {
                    Some(info) => info,
                    None => continue,
                };

                let value = find_value(&reading.sensors, operation.sensor_id());

                let sensor = match operation {
                    Operation::Share { sensor_id } => EncodedSensor::Share {
                        id: *sensor_id,
                        name: info.name.clone(),
                        description: info.description.clone(),
                        unit: info.unit.clone(),
                        value,
                    },
                    Operation::Bin { sensor_id, bins } => EncodedSensor::Bin {
                        id: *sensor_id,
                        name: info.name.clone(),
                        description: info.description.clone(),
                        unit: info.unit.clone(),
                        bins: bins.clone(),
                        values: binned_values(value, bins),
                    },
                    Operation::MovingAvg {
                        sensor_id,
                        interval,
                    } => {
                        let mean = match value {
                            Some(v) => Some(self.averager.moving_average(
                                v,
                                &device.device_token,
                                *sensor_id,
                                *interval,
                            )?),
                            None => None,
                        };

                        EncodedSensor::MovingAvg {
                            id: *sensor_id,
                            name: info.name.clone(),
                            description: info.description.clone(),
                            unit: info.unit.clone(),
                            interval: *interval,
                            value: mean,
                        }
                    }
                };

                sensors.push(sensor);
            }
        }

        Ok(Document {
            token: device.device_token.clone(),
            label: device.label.clone(),
            longitude: device.longitude,
            latitude: device.latitude,
            exposure: device.exposure.as_str().to_string(),
            recorded_at: reading.recorded_at,
            sensors,
        })
    }
}

fn find_value(sensors: &[RawSensor], id: u32) -> Option<f64> {
    sensors.iter().find(|s| s.id == id).and_then(|s| s.value)
}

/// Binned output for the given value. `bins` is an ascending list of
/// thresholds partitioning the number line into `bins.len() + 1` buckets; the
/// result holds a single 1 at the bucket the value falls into. A value
/// exactly on a threshold falls into the upper bucket; a missing value
/// produces all zeros.
pub fn binned_values(value: Option<f64>, bins: &[f64]) -> Vec<i64> {
    let mut out = vec![0i64; bins.len() + 1];

    let value = match value {
        Some(v) => v,
        None => return out,
    };

    let index = bins
        .iter()
        .position(|b| value < *b)
        .unwrap_or(bins.len());
    out[index] = 1;

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockAverager;
    use crate::models::Exposure;

    const PAYLOAD: &[u8] = br#"{"data":[{"recorded_at":"2018-12-11T14:46:44Z","sensors":[{"id":13,"value":51.0},{"id":14,"value":426.42},{"id":12,"value":12.58},{"id":29,"value":79.35}]}]}"#;

    fn device(streams: Vec<Stream>) -> Device {
        Device {
            id: 1,
            device_token: "foo".to_string(),
            label: Some("golden gate".to_string()),
            longitude: -0.024,
            latitude: 54.24,
            exposure: Exposure::Indoor,
            streams,
        }
    }

    fn transformer(averager: Arc<dyn MovingAverager>) -> Transformer {
        Transformer::new(SensorCatalog::load().unwrap(), averager)
    }

    #[test]
    fn binning_corner_cases() {
        assert_eq!(binned_values(Some(39.2), &[40.0]), vec![1, 0]);
        assert_eq!(binned_values(Some(40.0), &[40.0, 60.0]), vec![0, 1, 0]);
        assert_eq!(binned_values(Some(60.0), &[40.0, 60.0]), vec![0, 0, 1]);
        assert_eq!(
            binned_values(Some(43.15), &[40.0, 60.0, 80.0]),
            vec![0, 1, 0, 0]
        );
    }

    #[test]
    fn binning_misses_produce_all_zeros() {
        assert_eq!(binned_values(None, &[40.0, 60.0]), vec![0, 0, 0]);
    }

    #[test]
    fn binning_output_always_sums_to_one() {
        let bins = [10.0, 20.0, 30.0, 40.0];
        for value in [-5.0, 9.99, 10.0, 15.0, 20.0, 29.9, 39.99, 40.0, 400.0] {
            let out = binned_values(Some(value), &bins);
            assert_eq!(out.len(), bins.len() + 1, "value {}", value);
            assert_eq!(out.iter().sum::<i64>(), 1, "value {}", value);

            let hot = out.iter().position(|v| *v == 1).unwrap();
            let expected = bins.iter().position(|b| value < *b).unwrap_or(bins.len());
            assert_eq!(hot, expected, "value {}", value);
        }
    }

    #[test]
    fn parse_rejects_malformed_json() {
        let err = parse_payload(b"{ not json").unwrap_err();
        assert!(matches!(err, EncodeError::MalformedPayload(_)));
    }

    #[test]
    fn parse_rejects_empty_data() {
        let err = parse_payload(br#"{"data":[]}"#).unwrap_err();
        assert!(matches!(err, EncodeError::MalformedPayload(_)));
    }

    #[test]
    fn no_operations_passes_everything_through_in_payload_order() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let transformer = transformer(Arc::new(MockAverager::default()));
        let doc = transformer.transform(&device, &stream, &reading).unwrap();

        assert_eq!(doc.token, "foo");
        assert_eq!(doc.exposure, "indoor");
        let ids: Vec<u32> = doc
            .sensors
            .iter()
            .map(|s| match s {
                EncodedSensor::Share { id, .. } => *id,
                _ => panic!("expected SHARE"),
            })
            .collect();
        assert_eq!(ids, vec![13, 14, 12, 29]);
    }

    #[test]
    fn processing_the_same_payload_twice_is_idempotent() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let transformer = transformer(Arc::new(MockAverager::default()));
        let first = transformer.transform(&device, &stream, &reading).unwrap();
        let second = transformer.transform(&device, &stream, &reading).unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn operations_drive_output_order_and_shape() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![
                Operation::Share { sensor_id: 13 },
                Operation::Share { sensor_id: 14 },
                Operation::MovingAvg {
                    sensor_id: 12,
                    interval: 900,
                },
                Operation::Bin {
                    sensor_id: 29,
                    bins: vec![30.0, 80.0, 120.0],
                },
            ],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let averager = Arc::new(MockAverager::default());
        averager.expect(12.58, "foo", 12, 900, 12.58);

        let transformer = transformer(averager.clone());
        let doc = transformer.transform(&device, &stream, &reading).unwrap();

        assert_eq!(doc.sensors.len(), 4);

        match &doc.sensors[0] {
            EncodedSensor::Share { id, value, .. } => {
                assert_eq!(*id, 13);
                assert_eq!(*value, Some(51.0));
            }
            other => panic!("expected SHARE, got {:?}", other),
        }

        match &doc.sensors[2] {
            EncodedSensor::MovingAvg {
                id,
                interval,
                value,
                ..
            } => {
                assert_eq!(*id, 12);
                assert_eq!(*interval, 900);
                assert_eq!(*value, Some(12.58));
            }
            other => panic!("expected MOVING_AVG, got {:?}", other),
        }

        match &doc.sensors[3] {
            EncodedSensor::Bin { bins, values, .. } => {
                assert_eq!(bins, &vec![30.0, 80.0, 120.0]);
                // 79.35 < 80 so the hot index is 1
                assert_eq!(values, &vec![0, 1, 0, 0]);
            }
            other => panic!("expected BIN, got {:?}", other),
        }

        assert_eq!(averager.calls(), 1);
    }

    #[test]
    fn operation_without_metadata_is_dropped() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![
                Operation::Share { sensor_id: 13 },
                Operation::Share { sensor_id: 9999 },
            ],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let transformer = transformer(Arc::new(MockAverager::default()));
        let doc = transformer.transform(&device, &stream, &reading).unwrap();
        assert_eq!(doc.sensors.len(), 1);
    }

    #[test]
    fn operation_without_raw_sensor_emits_missing_value() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![
                // id 55 is in the catalog but not in the payload
                Operation::Share { sensor_id: 55 },
                Operation::Bin {
                    sensor_id: 56,
                    bins: vec![40.0],
                },
            ],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let transformer = transformer(Arc::new(MockAverager::default()));
        let doc = transformer.transform(&device, &stream, &reading).unwrap();

        match &doc.sensors[0] {
            EncodedSensor::Share { value, .. } => assert_eq!(*value, None),
            other => panic!("expected SHARE, got {:?}", other),
        }
        match &doc.sensors[1] {
            EncodedSensor::Bin { values, .. } => assert_eq!(values, &vec![0, 0]),
            other => panic!("expected BIN, got {:?}", other),
        }
    }

    #[test]
    fn document_serializes_the_expected_field_sets() {
        let stream = Stream {
            community_id: "c1".to_string(),
            public_key: "PK1".to_string(),
            operations: vec![Operation::Bin {
                sensor_id: 29,
                bins: vec![30.0, 80.0, 120.0],
            }],
        };
        let device = device(vec![]);
        let reading = parse_payload(PAYLOAD).unwrap();

        let transformer = transformer(Arc::new(MockAverager::default()));
        let doc = transformer.transform(&device, &stream, &reading).unwrap();
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["token"], "foo");
        assert_eq!(json["recordedAt"], "2018-12-11T14:46:44Z");
        let sensor = &json["sensors"][0];
        assert_eq!(sensor["type"], "BIN");
        assert!(sensor.get("value").is_none());
        assert_eq!(sensor["values"], serde_json::json!([0, 1, 0, 0]));
    }
}
