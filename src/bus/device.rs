use serde::Serialize;

use crate::config::DeviceConfig;

/// Device descriptor embedded in every discovery payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub version: String,
}

#[derive(Serialize)]
struct DevicePayload<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'a str,
    model: String,
    sw_version: &'a str,
}

impl DeviceInfo {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            manufacturer: "n/a".to_string(),
            version: "1".to_string(),
        }
    }

    pub fn model(&self) -> String {
        format!("{} v{}", self.id, self.version)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let payload = DevicePayload {
            identifiers: [&self.id],
            name: &self.name,
            manufacturer: &self.manufacturer,
            model: self.model(),
            sw_version: &self.version,
        };
        serde_json::to_value(payload).unwrap_or_default()
    }
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            manufacturer: config.manufacturer.clone(),
            version: config.version.clone(),
        }
    }
}
