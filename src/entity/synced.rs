// src/entity/synced.rs - Lock-guarded value cell mirrored to a bus topic
use std::sync::{Mutex, PoisonError};

use super::ParamValue;
use crate::bus::BusSlot;

/// Values that can be written to a state topic.
pub trait StatePayload: Clone + PartialEq + Send + 'static {
    fn to_payload(&self) -> String;
}

impl StatePayload for f64 {
    fn to_payload(&self) -> String {
        serde_json::Value::from(*self).to_string()
    }
}

impl StatePayload for ParamValue {
    fn to_payload(&self) -> String {
        match self {
            ParamValue::Integer(n) => n.to_string(),
            ParamValue::Number(n) => n.to_payload(),
            ParamValue::Text(s) => s.clone(),
        }
    }
}

/// A value cell whose writes are published to `topic`.
///
/// The lock covers only the compare-and-swap; the publish happens after it is
/// released so a slow bus never blocks readers.
#[derive(Debug)]
pub struct SyncedValue<T> {
    topic: String,
    retain: bool,
    value: Mutex<Option<T>>,
    bus: BusSlot,
}

impl<T: StatePayload> SyncedValue<T> {
    pub fn new(topic: String, retain: bool, initial: Option<T>, bus: BusSlot) -> Self {
        Self { topic, retain, value: Mutex::new(initial), bus }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Store and publish `value` unless it equals the current one.
    /// Returns true if the value changed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref() == Some(&value) {
                return false;
            }
            *current = Some(value.clone());
        }
        self.bus.publish(&self.topic, &value.to_payload(), self.retain);
        true
    }

    /// Store and publish `value` even if unchanged.
    pub fn set_forced(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        self.bus.publish(&self.topic, &value.to_payload(), self.retain);
    }

    /// Re-publish the current value. Nothing happens while the cell is empty.
    pub fn publish_current(&self) -> bool {
        match self.get() {
            Some(value) => self.bus.publish(&self.topic, &value.to_payload(), self.retain),
            None => false,
        }
    }

    /// Take a value that already is the bus state (e.g. a retained message)
    /// without echoing it back.
    pub(crate) fn adopt(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MessageBus};
    use std::sync::Arc;

    fn cell(initial: Option<f64>) -> (LocalBus, SyncedValue<f64>) {
        let (bus, _dispatcher) = LocalBus::new();
        let slot = BusSlot::default();
        slot.attach(Arc::new(bus.clone()) as Arc<dyn MessageBus>);
        (bus, SyncedValue::new("sensor/dev/t/state".to_string(), true, initial, slot))
    }

    #[test]
    fn test_equal_write_is_silent() {
        let (bus, value) = cell(Some(20.0));
        assert!(!value.set(20.0));
        assert!(bus.published().is_empty());
    }

    #[test]
    fn test_changed_write_publishes_once() {
        let (bus, value) = cell(Some(20.0));
        assert!(value.set(21.5));
        assert!(!value.set(21.5));
        assert_eq!(bus.published_to("sensor/dev/t/state"), vec!["21.5"]);
        assert_eq!(bus.retained("sensor/dev/t/state").as_deref(), Some("21.5"));
    }

    #[test]
    fn test_forced_write_always_publishes() {
        let (bus, value) = cell(Some(20.0));
        value.set_forced(20.0);
        value.set_forced(20.0);
        assert_eq!(bus.published_to("sensor/dev/t/state").len(), 2);
    }

    #[test]
    fn test_adopt_does_not_echo() {
        let (bus, value) = cell(None);
        value.adopt(18.0);
        assert_eq!(value.get(), Some(18.0));
        assert!(bus.published().is_empty());
    }

    #[test]
    fn test_text_payload_is_raw() {
        assert_eq!(ParamValue::from("heat").to_payload(), "heat");
        assert_eq!(ParamValue::from(1200).to_payload(), "1200");
        assert_eq!(ParamValue::from(1.5).to_payload(), "1.5");
    }
}
