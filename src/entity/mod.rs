//! Bus-exposed entities: single synchronized parameters and the composite
//! climate entity, plus the registry that connects them to a bus and
//! publishes their discovery configs.

pub mod bootstrap;
pub mod climate;
pub mod parameter;
pub mod synced;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::bus::{BusError, BusSlot, DeviceInfo, MessageBus};

pub use climate::{ClimateEntity, ClimateOptions, Mode};
pub use parameter::{Bounds, CommandHandler, Parameter, ParameterOptions};
pub use synced::{StatePayload, SyncedValue};

/// Construction-time errors.
#[derive(Debug, Error, PartialEq)]
pub enum EntityError {
    #[error("Entity '{object_id}': domain '{domain}' is read-only and cannot take a command handler")]
    HandlerOnReadOnly { object_id: String, domain: Domain },
    #[error("Entity '{object_id}': domain '{domain}' requires a command handler")]
    MissingHandler { object_id: String, domain: Domain },
    #[error("Entity '{object_id}': invalid bounds {min}..{max}")]
    InvalidBounds { object_id: String, min: f64, max: f64 },
}

/// Why an inbound command was refused. No state is changed when one is returned.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Value {value} outside {min}..{max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Handler failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Sensor,
    Number,
    Climate,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Sensor => "sensor",
            Domain::Number => "number",
            Domain::Climate => "climate",
        }
    }

    /// Sensors only ever report state.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Domain::Sensor)
    }

    pub fn requires_handler(&self) -> bool {
        matches!(self, Domain::Number | Domain::Climate)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value held by a generic parameter.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view. NaN and infinities count as non-numeric.
    pub fn as_f64(&self) -> Option<f64> {
        let number = match self {
            ParamValue::Integer(n) => *n as f64,
            ParamValue::Number(n) => *n,
            ParamValue::Text(s) => s.trim().parse().ok()?,
        };
        number.is_finite().then_some(number)
    }

    /// Accepts JSON numbers and strings; anything else is refused.
    pub fn from_json(value: &Value) -> Result<Self, CommandError> {
        match value {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(ParamValue::Integer(i)),
                (None, Some(f)) => Ok(ParamValue::Number(f)),
                _ => Err(CommandError::InvalidPayload(n.to_string())),
            },
            Value::String(s) => Ok(ParamValue::Text(s.clone())),
            other => Err(CommandError::InvalidPayload(other.to_string())),
        }
    }
}

/// `Integer(3)` and `Number(3.0)` are the same value.
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            (ParamValue::Text(_), _) | (_, ParamValue::Text(_)) => false,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Integer(value as i64)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(n) => write!(f, "{}", n),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// Something the registry can connect to a bus and advertise.
pub trait Entity: Send + Sync {
    fn object_id(&self) -> &str;
    fn domain(&self) -> Domain;
    fn discovery_payload(&self, device: &DeviceInfo) -> Value;

    /// Attach the bus, run the retained-state bootstrap for every commandable
    /// field and subscribe to command topics.
    fn connect(self: Arc<Self>, bus: &Arc<dyn MessageBus>, fallback_after: Duration) -> Result<(), BusError>;

    fn disconnect(&self);

    fn discovery_topic(&self, device: &DeviceInfo) -> String {
        format!("homeassistant/{}/{}_{}/config", self.domain(), device.id, self.object_id())
    }
}

/// Log the outcome of an inbound command. Rejections are the sender's problem
/// and only warn; handler failures are ours.
pub(crate) fn report_command(object_id: &str, result: Result<(), CommandError>) {
    match result {
        Ok(()) => {}
        Err(e @ CommandError::Failed(_)) => tracing::error!("Command for '{}' failed: {}", object_id, e),
        Err(e) => tracing::warn!("Command for '{}' ignored: {}", object_id, e),
    }
}

pub(crate) fn base_topic(domain: Domain, device: &DeviceInfo, object_id: &str) -> String {
    let prefix = if device.id.is_empty() { object_id } else { device.id.as_str() };
    format!("{}/{}/{}", domain, prefix, object_id)
}

/// Owns the entity list for one device and connects it to a bus.
pub struct EntityRegistry {
    device: DeviceInfo,
    fallback_after: Duration,
    entities: Vec<Arc<dyn Entity>>,
    bus: BusSlot,
}

impl EntityRegistry {
    pub fn new(device: DeviceInfo, fallback_after: Duration) -> Self {
        Self { device, fallback_after, entities: Vec::new(), bus: BusSlot::default() }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn register<E: Entity + 'static>(&mut self, entity: Arc<E>) -> Arc<E> {
        self.entities.push(entity.clone());
        entity
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Must run inside a tokio runtime: bootstrap fallbacks are timer tasks.
    pub fn connect(&self, bus: Arc<dyn MessageBus>) -> Result<(), BusError> {
        tracing::info!("Bus connected, bootstrapping {} entities", self.entities.len());
        self.bus.attach(bus.clone());
        for entity in &self.entities {
            entity.clone().connect(&bus, self.fallback_after)?;
        }
        self.publish_discovery();
        Ok(())
    }

    pub fn disconnect(&self) {
        tracing::warn!("Bus disconnected");
        for entity in &self.entities {
            entity.disconnect();
        }
        self.bus.detach();
    }

    pub fn publish_discovery(&self) {
        for entity in &self.entities {
            let topic = entity.discovery_topic(&self.device);
            let payload = entity.discovery_payload(&self.device).to_string();
            if self.bus.publish(&topic, &payload, true) {
                tracing::debug!("Published discovery {} -> {}", entity.object_id(), topic);
            }
        }
    }
}
