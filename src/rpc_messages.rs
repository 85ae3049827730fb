//! Wire messages for the encoder RPC surface. Requests arrive either as JSON
//! or as length-delimited protobuf depending on content type, so every
//! message derives both serde and prost. Written out by hand: the service
//! exposes exactly two methods and carrying a codegen step for them buys
//! nothing.

use serde::{Deserialize, Serialize};

/// Where the device is mounted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Exposure {
    Unknown = 0,
    Indoor = 1,
    Outdoor = 2,
}

impl Exposure {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Exposure::Unknown => "unknown",
            Exposure::Indoor => "indoor",
            Exposure::Outdoor => "outdoor",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Exposure> {
        match name.to_ascii_lowercase().as_str() {
            "unknown" => Some(Exposure::Unknown),
            "indoor" => Some(Exposure::Indoor),
            "outdoor" => Some(Exposure::Outdoor),
            _ => None,
        }
    }
}

/// The transformation to apply for a sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Action {
    Share = 0,
    Bin = 1,
    MovingAvg = 2,
}

impl Action {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Action::Share => "SHARE",
            Action::Bin => "BIN",
            Action::MovingAvg => "MOVING_AVG",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Action> {
        match name.to_ascii_uppercase().as_str() {
            "SHARE" => Some(Action::Share),
            "BIN" => Some(Action::Bin),
            "MOVING_AVG" => Some(Action::MovingAvg),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    #[prost(double, tag = "1")]
    pub longitude: f64,
    #[prost(double, tag = "2")]
    pub latitude: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    #[prost(uint32, tag = "1")]
    pub sensor_id: u32,
    #[prost(enumeration = "Action", tag = "2")]
    #[serde(with = "action_serde")]
    pub action: i32,
    #[prost(double, repeated, tag = "3")]
    pub bins: Vec<f64>,
    #[prost(uint32, tag = "4")]
    pub interval: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateStreamRequest {
    #[prost(string, tag = "1")]
    pub device_token: String,
    #[prost(string, tag = "2")]
    pub community_id: String,
    #[prost(string, tag = "3")]
    pub recipient_public_key: String,
    #[prost(message, optional, tag = "4")]
    pub location: Option<Location>,
    #[prost(enumeration = "Exposure", tag = "5")]
    #[serde(with = "exposure_serde")]
    pub exposure: i32,
    #[prost(string, tag = "6")]
    pub device_label: String,
    #[prost(message, repeated, tag = "7")]
    pub operations: Vec<Operation>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateStreamResponse {
    #[prost(string, tag = "1")]
    pub stream_uid: String,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteStreamRequest {
    #[prost(string, tag = "1")]
    pub stream_uid: String,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeleteStreamResponse {}

mod exposure_serde {
    use super::Exposure;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        let name = Exposure::try_from(*value)
            .map(|e| e.as_str_name())
            .unwrap_or("unknown");
        serializer.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        struct ExposureVisitor;

        impl Visitor<'_> for ExposureVisitor {
            type Value = i32;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an exposure name or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<i32, E> {
                Exposure::from_str_name(v)
                    .map(|e| e as i32)
                    .ok_or_else(|| E::custom(format!("unknown exposure: {}", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<i32, E> {
                Ok(v as i32)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<i32, E> {
                Ok(v as i32)
            }
        }

        deserializer.deserialize_any(ExposureVisitor)
    }
}

mod action_serde {
    use super::Action;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        let name = Action::try_from(*value)
            .map(|a| a.as_str_name())
            .unwrap_or("SHARE");
        serializer.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        struct ActionVisitor;

        impl Visitor<'_> for ActionVisitor {
            type Value = i32;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an action name or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<i32, E> {
                Action::from_str_name(v)
                    .map(|a| a as i32)
                    .ok_or_else(|| E::custom(format!("unknown action: {}", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<i32, E> {
                Ok(v as i32)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<i32, E> {
                Ok(v as i32)
            }
        }

        deserializer.deserialize_any(ActionVisitor)
    }
}
