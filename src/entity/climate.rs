// src/entity/climate.rs - Composite climate entity
//
// Four independently locked fields share one discovery config: the target
// temperature and the mode are commandable and bootstrap from retained state on
// their own, current temperature and humidity are plain telemetry.

use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::bootstrap::{DelayedTask, bootstrap_state};
use super::{CommandError, Domain, Entity, EntityError, ParamValue, StatePayload, SyncedValue, base_topic, report_command};
use crate::bus::{BusError, BusSlot, DeviceInfo, Message, MessageBus, decode_payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Off,
    Auto,
    Heat,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Off, Mode::Auto, Mode::Heat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Auto => "auto",
            Mode::Heat => "heat",
        }
    }

    /// Closed-loop control runs in every mode but `off`.
    pub fn is_active(&self) -> bool {
        !matches!(self, Mode::Off)
    }
}

impl FromStr for Mode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Mode::Off),
            "auto" => Ok(Mode::Auto),
            "heat" => Ok(Mode::Heat),
            other => Err(CommandError::Rejected(format!("unsupported mode '{}'", other))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StatePayload for Mode {
    fn to_payload(&self) -> String {
        self.as_str().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ClimateOptions {
    pub unit: String,
    pub temp_step: f64,
    pub min_temp: f64,
    pub max_temp: f64,
    pub retain: bool,
    pub target_temperature: f64,
    pub mode: Mode,
    pub modes: Vec<Mode>,
}

impl Default for ClimateOptions {
    fn default() -> Self {
        Self {
            unit: "°C".to_string(),
            temp_step: 0.1,
            min_temp: 15.0,
            max_temp: 30.0,
            retain: true,
            target_temperature: 0.0,
            mode: Mode::Off,
            modes: Mode::ALL.to_vec(),
        }
    }
}

pub type TemperatureHandler = Arc<dyn Fn(f64) -> Result<(), CommandError> + Send + Sync>;
pub type ModeHandler = Arc<dyn Fn(Mode) -> Result<(), CommandError> + Send + Sync>;

#[derive(Debug, Clone)]
struct ClimateTopics {
    temperature_state: String,
    temperature_command: String,
    mode_state: String,
    mode_command: String,
    current_temperature: String,
    current_humidity: String,
}

impl ClimateTopics {
    fn new(base: &str) -> Self {
        Self {
            temperature_state: format!("{}/target_temperature/state", base),
            temperature_command: format!("{}/target_temperature/set", base),
            mode_state: format!("{}/mode/state", base),
            mode_command: format!("{}/mode/set", base),
            current_temperature: format!("{}/current_temperature", base),
            current_humidity: format!("{}/current_humidity", base),
        }
    }
}

pub struct ClimateEntity {
    object_id: String,
    name: String,
    options: ClimateOptions,
    topics: ClimateTopics,
    target_temperature: SyncedValue<f64>,
    mode: SyncedValue<Mode>,
    current_temperature: SyncedValue<f64>,
    current_humidity: SyncedValue<f64>,
    bus: BusSlot,
    on_temperature: TemperatureHandler,
    on_mode: ModeHandler,
    fallbacks: Mutex<Vec<DelayedTask>>,
}

impl ClimateEntity {
    pub fn new(
        device: &DeviceInfo,
        object_id: &str,
        name: &str,
        options: ClimateOptions,
        on_temperature: TemperatureHandler,
        on_mode: ModeHandler,
    ) -> Result<Self, EntityError> {
        if !(options.min_temp < options.max_temp) {
            return Err(EntityError::InvalidBounds {
                object_id: object_id.to_string(),
                min: options.min_temp,
                max: options.max_temp,
            });
        }
        let topics = ClimateTopics::new(&base_topic(Domain::Climate, device, object_id));
        let bus = BusSlot::default();
        let retain = options.retain;
        Ok(Self {
            object_id: object_id.to_string(),
            name: name.to_string(),
            target_temperature: SyncedValue::new(
                topics.temperature_state.clone(),
                retain,
                Some(options.target_temperature),
                bus.clone(),
            ),
            mode: SyncedValue::new(topics.mode_state.clone(), retain, Some(options.mode), bus.clone()),
            current_temperature: SyncedValue::new(topics.current_temperature.clone(), retain, None, bus.clone()),
            current_humidity: SyncedValue::new(topics.current_humidity.clone(), retain, None, bus.clone()),
            options,
            topics,
            bus,
            on_temperature,
            on_mode,
            fallbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_temperature.get().unwrap_or(self.options.target_temperature)
    }

    pub fn set_target_temperature(&self, value: f64) -> bool {
        self.target_temperature.set(value)
    }

    pub fn mode(&self) -> Mode {
        self.mode.get().unwrap_or_default()
    }

    pub fn set_mode(&self, mode: Mode) -> bool {
        self.mode.set(mode)
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.current_temperature.get()
    }

    pub fn set_current_temperature(&self, value: f64) -> bool {
        self.current_temperature.set(value)
    }

    pub fn current_humidity(&self) -> Option<f64> {
        self.current_humidity.get()
    }

    pub fn set_current_humidity(&self, value: f64) -> bool {
        self.current_humidity.set(value)
    }

    pub fn mode_command_topic(&self) -> &str {
        &self.topics.mode_command
    }

    pub fn temperature_command_topic(&self) -> &str {
        &self.topics.temperature_command
    }

    pub fn handle_temperature_command(&self, raw: &str) -> Result<(), CommandError> {
        let value = self.parse_temperature(raw)?;
        (self.on_temperature)(value)?;
        self.target_temperature.set(value);
        Ok(())
    }

    pub fn handle_mode_command(&self, raw: &str) -> Result<(), CommandError> {
        let mode = self.parse_mode(raw)?;
        (self.on_mode)(mode)?;
        self.mode.set(mode);
        Ok(())
    }

    fn parse_temperature(&self, raw: &str) -> Result<f64, CommandError> {
        let value = ParamValue::from_json(&decode_payload(raw))?
            .as_f64()
            .ok_or_else(|| CommandError::InvalidPayload(raw.to_string()))?;
        if !(self.options.min_temp..=self.options.max_temp).contains(&value) {
            return Err(CommandError::OutOfRange { value, min: self.options.min_temp, max: self.options.max_temp });
        }
        Ok(value)
    }

    fn parse_mode(&self, raw: &str) -> Result<Mode, CommandError> {
        let mode = match decode_payload(raw) {
            Value::String(s) => s.parse::<Mode>()?,
            other => return Err(CommandError::InvalidPayload(other.to_string())),
        };
        if !self.options.modes.contains(&mode) {
            return Err(CommandError::Rejected(format!("mode '{}' not enabled", mode)));
        }
        Ok(mode)
    }

    fn load_retained_temperature(&self, raw: &str) {
        let result = self.parse_temperature(raw).and_then(|value| {
            self.target_temperature.adopt(value);
            (self.on_temperature)(value)
        });
        if let Err(e) = result {
            tracing::warn!("Retained target temperature for '{}' not applied: {}", self.object_id, e);
        }
    }

    fn load_retained_mode(&self, raw: &str) {
        let result = self.parse_mode(raw).and_then(|mode| {
            self.mode.adopt(mode);
            (self.on_mode)(mode)
        });
        if let Err(e) = result {
            tracing::warn!("Retained mode for '{}' not applied: {}", self.object_id, e);
        }
    }

    fn remember(&self, task: DelayedTask) {
        self.fallbacks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }
}

impl Entity for ClimateEntity {
    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn domain(&self) -> Domain {
        Domain::Climate
    }

    fn discovery_payload(&self, device: &DeviceInfo) -> Value {
        let modes: Vec<&str> = self.options.modes.iter().map(Mode::as_str).collect();
        json!({
            "name": self.name,
            "unique_id": format!("{}_{}", device.id, self.object_id),
            "device": device.to_json(),
            "current_temperature_topic": self.topics.current_temperature,
            "current_humidity_topic": self.topics.current_humidity,
            "temperature_state_topic": self.topics.temperature_state,
            "temperature_command_topic": self.topics.temperature_command,
            "mode_state_topic": self.topics.mode_state,
            "mode_command_topic": self.topics.mode_command,
            "modes": modes,
            "temperature_unit": if self.options.unit.ends_with('F') { "F" } else { "C" },
            "temp_step": self.options.temp_step,
            "min_temp": self.options.min_temp,
            "max_temp": self.options.max_temp,
        })
    }

    fn connect(self: Arc<Self>, bus: &Arc<dyn MessageBus>, fallback_after: Duration) -> Result<(), BusError> {
        self.bus.attach(bus.clone());

        let (loader, default) = (Arc::downgrade(&self), Arc::downgrade(&self));
        let task = bootstrap_state(
            bus,
            &self.topics.temperature_state,
            fallback_after,
            move |msg| {
                if let Some(climate) = loader.upgrade() {
                    climate.load_retained_temperature(&msg.payload);
                }
            },
            move || {
                if let Some(climate) = default.upgrade() {
                    climate.target_temperature.publish_current();
                }
            },
        )?;
        self.remember(task);

        let (loader, default) = (Arc::downgrade(&self), Arc::downgrade(&self));
        let task = bootstrap_state(
            bus,
            &self.topics.mode_state,
            fallback_after,
            move |msg| {
                if let Some(climate) = loader.upgrade() {
                    climate.load_retained_mode(&msg.payload);
                }
            },
            move || {
                if let Some(climate) = default.upgrade() {
                    climate.mode.publish_current();
                }
            },
        )?;
        self.remember(task);

        let weak = Arc::downgrade(&self);
        bus.subscribe(
            &self.topics.temperature_command,
            Arc::new(move |msg: &Message| {
                if let Some(climate) = weak.upgrade() {
                    report_command(&climate.object_id, climate.handle_temperature_command(&msg.payload));
                }
                Ok(())
            }),
        )?;
        let weak = Arc::downgrade(&self);
        bus.subscribe(
            &self.topics.mode_command,
            Arc::new(move |msg: &Message| {
                if let Some(climate) = weak.upgrade() {
                    report_command(&climate.object_id, climate.handle_mode_command(&msg.payload));
                }
                Ok(())
            }),
        )
    }

    fn disconnect(&self) {
        for task in self.fallbacks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.cancel();
        }
        self.bus.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn climate(modes_seen: Arc<AtomicUsize>) -> ClimateEntity {
        let options = ClimateOptions { target_temperature: 20.0, ..ClimateOptions::default() };
        ClimateEntity::new(
            &DeviceInfo::new("dev", "Device"),
            "climate",
            "Climate",
            options,
            Arc::new(|_t| Ok(())),
            Arc::new(move |_m| {
                modes_seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("heat".parse::<Mode>().unwrap(), Mode::Heat);
        assert_eq!(" AUTO ".parse::<Mode>().unwrap(), Mode::Auto);
        assert!("cool".parse::<Mode>().is_err());
        assert!(!Mode::Off.is_active());
    }

    #[test]
    fn test_unknown_mode_rejected_without_state_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let entity = climate(calls.clone());
        assert!(entity.handle_mode_command("cool").is_err());
        assert!(entity.handle_mode_command("3").is_err());
        assert_eq!(entity.mode(), Mode::Off);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        entity.handle_mode_command("heat").unwrap();
        assert_eq!(entity.mode(), Mode::Heat);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_temperature_command_bounds() {
        let entity = climate(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(entity.handle_temperature_command("45"), Err(CommandError::OutOfRange { .. })));
        assert_eq!(entity.target_temperature(), 20.0);
        entity.handle_temperature_command("21.5").unwrap();
        assert_eq!(entity.target_temperature(), 21.5);
    }

    #[test]
    fn test_non_finite_temperature_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let entity = ClimateEntity::new(
            &DeviceInfo::new("dev", "Device"),
            "climate",
            "Climate",
            ClimateOptions { target_temperature: 20.0, ..ClimateOptions::default() },
            Arc::new(move |t| {
                sink.lock().unwrap().push(t);
                Ok(())
            }),
            Arc::new(|_m| Ok(())),
        )
        .unwrap();
        for raw in ["nan", "NaN", "inf", "\"-inf\""] {
            assert!(matches!(entity.handle_temperature_command(raw), Err(CommandError::InvalidPayload(_))), "{}", raw);
        }
        assert_eq!(entity.target_temperature(), 20.0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_discovery_payload() {
        let device = DeviceInfo::new("dev", "Device");
        let entity = climate(Arc::new(AtomicUsize::new(0)));
        let payload = entity.discovery_payload(&device);
        assert_eq!(payload["modes"], json!(["off", "auto", "heat"]));
        assert_eq!(payload["mode_command_topic"], "climate/dev/climate/mode/set");
        assert_eq!(payload["current_humidity_topic"], "climate/dev/climate/current_humidity");
        assert_eq!(payload["min_temp"], 15.0);
        assert_eq!(entity.discovery_topic(&device), "homeassistant/climate/dev_climate/config");
    }
}
