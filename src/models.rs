use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{devices, streams};

/// Where a device is mounted. Serialized lower-case on every wire surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Unknown,
    Indoor,
    Outdoor,
}

impl Exposure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exposure::Unknown => "unknown",
            Exposure::Indoor => "indoor",
            Exposure::Outdoor => "outdoor",
        }
    }

    /// Parse a stored value, falling back to `Unknown` for anything else.
    pub fn parse(s: &str) -> Exposure {
        match s {
            "indoor" => Exposure::Indoor,
            "outdoor" => Exposure::Outdoor,
            _ => Exposure::Unknown,
        }
    }
}

/// A per-sensor transformation declared within a stream. Persisted as JSON
/// inside a single column, with `action` as the discriminator. New actions
/// are added as new variants; existing rows are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Operation {
    /// Share the sensor at full resolution.
    #[serde(rename = "SHARE", rename_all = "camelCase")]
    Share { sensor_id: u32 },

    /// Share which bin the value falls into.
    #[serde(rename = "BIN", rename_all = "camelCase")]
    Bin { sensor_id: u32, bins: Vec<f64> },

    /// Share a windowed moving average of the value.
    #[serde(rename = "MOVING_AVG", rename_all = "camelCase")]
    MovingAvg { sensor_id: u32, interval: u32 },
}

impl Operation {
    pub fn sensor_id(&self) -> u32 {
        match self {
            Operation::Share { sensor_id } => *sensor_id,
            Operation::Bin { sensor_id, .. } => *sensor_id,
            Operation::MovingAvg { sensor_id, .. } => *sensor_id,
        }
    }
}

/// A device as read back from the registry. A single device may feed data to
/// multiple streams, hence the separation with the associated `Stream` type.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i32,
    pub device_token: String,
    pub label: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub exposure: Exposure,

    pub streams: Vec<Stream>,
}

/// A stream as read back from the registry, ready for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub community_id: String,
    pub public_key: String,
    pub operations: Vec<Operation>,
}

/// Device fields accepted when creating a stream. The device row is upserted
/// by `device_token`, overwriting the mutable fields.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_token: String,
    pub label: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub exposure: Exposure,
}

/// Input to `Registry::create_stream`.
#[derive(Debug, Clone)]
pub struct NewStream {
    pub device: NewDevice,
    pub community_id: String,
    pub public_key: String,
    pub operations: Vec<Operation>,
}

/// Output of `Registry::create_stream`. This is the only place the plaintext
/// delete token ever leaves the registry.
#[derive(Debug, Clone)]
pub struct CreatedStream {
    pub stream_id: String,
    pub token: String,
}

// Database rows.

#[derive(Debug, Queryable)]
pub struct DeviceRow {
    pub id: i32,
    pub device_token: String,
    pub device_label: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub exposure: String,
}

#[derive(Insertable)]
#[diesel(table_name = devices)]
pub struct NewDeviceRow<'a> {
    pub device_token: &'a str,
    pub device_label: Option<&'a str>,
    pub longitude: f64,
    pub latitude: f64,
    pub exposure: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = streams)]
pub struct NewStreamRow<'a> {
    pub uuid: &'a str,
    pub device_id: i32,
    pub community_id: &'a str,
    pub public_key: &'a str,
    pub token: &'a [u8],
    pub operations: &'a str,
}
