use std::collections::HashMap;

use serde::Deserialize;

use crate::error::EncodeError;

/// Metadata describing a single sensor channel, parsed from the static copy
/// of the SmartCitizen sensor list we embed in the binary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorInfo {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub unit: Option<String>,
}

/// In-memory lookup of sensor metadata by id. Loaded once at startup; raw
/// sensors whose id is missing from the catalog are dropped from enriched
/// output.
pub struct SensorCatalog {
    sensors: HashMap<u32, SensorInfo>,
}

impl SensorCatalog {
    /// Parse the embedded sensor list into a map keyed by sensor id.
    pub fn load() -> Result<SensorCatalog, EncodeError> {
        Self::from_json(include_str!("sensors.json"))
    }

    fn from_json(data: &str) -> Result<SensorCatalog, EncodeError> {
        let list: Vec<SensorInfo> = serde_json::from_str(data)
            .map_err(|e| EncodeError::Internal(format!("failed to parse sensor metadata: {}", e)))?;

        let mut sensors = HashMap::new();
        for sensor in list {
            sensors.insert(sensor.id, sensor);
        }

        Ok(SensorCatalog { sensors })
    }

    pub fn get(&self, id: u32) -> Option<&SensorInfo> {
        self.sensors.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
