// src/entity/parameter.rs - Single-value bus entity (sensor or number)
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::bootstrap::{DelayedTask, bootstrap_state};
use super::{CommandError, Domain, Entity, EntityError, ParamValue, SyncedValue, base_topic, report_command};
use crate::bus::{BusError, BusSlot, DeviceInfo, Message, MessageBus, decode_payload};

/// Inclusive numeric range advertised for number entities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct ParameterOptions {
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub value: Option<ParamValue>,
    pub retain: bool,
    pub bounds: Option<Bounds>,
}

impl Default for ParameterOptions {
    fn default() -> Self {
        Self { unit: None, device_class: None, value: None, retain: true, bounds: None }
    }
}

impl ParameterOptions {
    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn device_class(mut self, class: &str) -> Self {
        self.device_class = Some(class.to_string());
        self
    }

    pub fn value(mut self, value: impl Into<ParamValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn bounds(mut self, min: f64, max: f64, step: f64) -> Self {
        self.bounds = Some(Bounds::new(min, max, step));
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Command handler. Returning `Ok` accepts the value and the parameter stores
/// and publishes it; any error leaves the parameter untouched.
///
/// Runs on the bus delivery context: must not block.
pub type CommandHandler = Arc<dyn Fn(&ParamValue) -> Result<(), CommandError> + Send + Sync>;

pub struct Parameter {
    domain: Domain,
    object_id: String,
    name: String,
    unit: Option<String>,
    device_class: Option<String>,
    bounds: Option<Bounds>,
    state_topic: String,
    command_topic: Option<String>,
    value: SyncedValue<ParamValue>,
    bus: BusSlot,
    handler: Option<CommandHandler>,
    fallback: Mutex<Option<DelayedTask>>,
}

impl Parameter {
    pub fn new(
        device: &DeviceInfo,
        domain: Domain,
        object_id: &str,
        name: &str,
        options: ParameterOptions,
        handler: Option<CommandHandler>,
    ) -> Result<Self, EntityError> {
        match (&handler, domain.is_read_only(), domain.requires_handler()) {
            (Some(_), true, _) => {
                return Err(EntityError::HandlerOnReadOnly { object_id: object_id.to_string(), domain });
            }
            (None, _, true) => {
                return Err(EntityError::MissingHandler { object_id: object_id.to_string(), domain });
            }
            _ => {}
        }
        if let Some(bounds) = options.bounds {
            if !(bounds.min < bounds.max) {
                return Err(EntityError::InvalidBounds {
                    object_id: object_id.to_string(),
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }

        let base = base_topic(domain, device, object_id);
        let state_topic = format!("{}/state", base);
        let command_topic = handler.as_ref().map(|_| format!("{}/set", base));
        let bus = BusSlot::default();
        let value = SyncedValue::new(state_topic.clone(), options.retain, options.value, bus.clone());

        Ok(Self {
            domain,
            object_id: object_id.to_string(),
            name: name.to_string(),
            unit: options.unit,
            device_class: options.device_class,
            bounds: options.bounds,
            state_topic,
            command_topic,
            value,
            bus,
            handler,
            fallback: Mutex::new(None),
        })
    }

    /// Read-only telemetry entity.
    pub fn sensor(device: &DeviceInfo, object_id: &str, name: &str, options: ParameterOptions) -> Result<Self, EntityError> {
        Self::new(device, Domain::Sensor, object_id, name, options, None)
    }

    /// Commandable numeric entity.
    pub fn number(
        device: &DeviceInfo,
        object_id: &str,
        name: &str,
        options: ParameterOptions,
        handler: CommandHandler,
    ) -> Result<Self, EntityError> {
        Self::new(device, Domain::Number, object_id, name, options, Some(handler))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn command_topic(&self) -> Option<&str> {
        self.command_topic.as_deref()
    }

    pub fn get(&self) -> Option<ParamValue> {
        self.value.get()
    }

    /// Numeric view of the value; 0 while unset or non-numeric.
    pub fn get_f64(&self) -> f64 {
        self.value.get().and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn set(&self, value: impl Into<ParamValue>) -> bool {
        self.value.set(value.into())
    }

    pub fn set_forced(&self, value: impl Into<ParamValue>) {
        self.value.set_forced(value.into())
    }

    /// Decode, validate and forward an inbound command; store it if the handler accepts.
    pub fn handle_command(&self, raw: &str) -> Result<(), CommandError> {
        let value = self.validate(raw)?;
        self.invoke_handler(&value)?;
        self.value.set(value);
        Ok(())
    }

    /// Adopt a retained state value, then bring downstream state in line with it.
    pub fn load_retained(&self, raw: &str) -> Result<(), CommandError> {
        let value = self.validate(raw)?;
        self.value.adopt(value.clone());
        self.invoke_handler(&value)
    }

    fn invoke_handler(&self, value: &ParamValue) -> Result<(), CommandError> {
        match &self.handler {
            Some(handler) => handler(value),
            None => Err(CommandError::Rejected(format!("'{}' is read-only", self.object_id))),
        }
    }

    fn validate(&self, raw: &str) -> Result<ParamValue, CommandError> {
        let mut value = ParamValue::from_json(&decode_payload(raw))?;
        if self.domain == Domain::Number {
            if let ParamValue::Text(text) = &value {
                let number = text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| CommandError::InvalidPayload(text.clone()))?;
                value = ParamValue::Number(number);
            }
        }
        if let Some(bounds) = self.bounds {
            let number = value.as_f64().ok_or_else(|| CommandError::InvalidPayload(raw.to_string()))?;
            if !bounds.contains(number) {
                return Err(CommandError::OutOfRange { value: number, min: bounds.min, max: bounds.max });
            }
        }
        Ok(value)
    }

    fn on_command(&self, message: &Message) {
        report_command(&self.object_id, self.handle_command(&message.payload));
    }

    fn on_retained(&self, message: &Message) {
        if let Err(e) = self.load_retained(&message.payload) {
            tracing::warn!("Retained state for '{}' not applied: {}", self.object_id, e);
        }
    }
}

impl Entity for Parameter {
    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn domain(&self) -> Domain {
        self.domain
    }

    fn discovery_payload(&self, device: &DeviceInfo) -> Value {
        let mut payload = json!({
            "name": self.name,
            "unique_id": format!("{}_{}", device.id, self.object_id),
            "state_topic": self.state_topic,
            "device": device.to_json(),
        });
        if let Some(topic) = &self.command_topic {
            payload["command_topic"] = json!(topic);
        }
        if let Some(unit) = &self.unit {
            payload["unit_of_measurement"] = json!(unit);
        }
        if let Some(class) = &self.device_class {
            payload["device_class"] = json!(class);
        }
        if let (Domain::Number, Some(bounds)) = (self.domain, self.bounds) {
            payload["min"] = json!(bounds.min);
            payload["max"] = json!(bounds.max);
            payload["step"] = json!(bounds.step);
        }
        payload
    }

    fn connect(self: Arc<Self>, bus: &Arc<dyn MessageBus>, fallback_after: Duration) -> Result<(), BusError> {
        self.bus.attach(bus.clone());
        let Some(command_topic) = self.command_topic.clone() else {
            return Ok(());
        };

        let loader = Arc::downgrade(&self);
        let default = Arc::downgrade(&self);
        let fallback = bootstrap_state(
            bus,
            &self.state_topic,
            fallback_after,
            move |msg| {
                if let Some(param) = loader.upgrade() {
                    param.on_retained(msg);
                }
            },
            move || {
                if let Some(param) = default.upgrade() {
                    param.value.publish_current();
                }
            },
        )?;
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = Some(fallback);

        let weak = Arc::downgrade(&self);
        bus.subscribe(
            &command_topic,
            Arc::new(move |msg: &Message| {
                if let Some(param) = weak.upgrade() {
                    param.on_command(msg);
                }
                Ok(())
            }),
        )
    }

    fn disconnect(&self) {
        if let Some(fallback) = self.fallback.lock().unwrap_or_else(PoisonError::into_inner).take() {
            fallback.cancel();
        }
        self.bus.detach();
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("object_id", &self.object_id)
            .field("domain", &self.domain)
            .field("value", &self.value.get())
            .finish()
    }
}
