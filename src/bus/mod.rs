//! Publish/subscribe bus abstraction.
//!
//! The wire protocol is owned by whatever implements [`MessageBus`]. Handlers
//! registered through [`MessageBus::subscribe`] run on the bus implementation's
//! delivery context, concurrently with the control tasks. They must not block:
//! they only touch short-lived locks and publish.

pub mod device;
pub mod local;

use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub use device::DeviceInfo;
pub use local::{BusDispatcher, LocalBus};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus is shut down")]
    Closed,
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Handler failed: {0}")]
    Handler(String),
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

/// Topic handler. Errors are logged by the dispatcher, never propagated further.
pub type Handler = Arc<dyn Fn(&Message) -> Result<(), BusError> + Send + Sync>;

pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError>;
    /// Replaces any handler already registered for `topic`.
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}

/// Decode an inbound payload: JSON if it parses, otherwise the raw text.
pub fn decode_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Late-bound, shared handle to the bus. Empty while disconnected; publishes
/// through an empty slot are skipped with a warning.
#[derive(Clone, Default)]
pub struct BusSlot {
    inner: Arc<RwLock<Option<Arc<dyn MessageBus>>>>,
}

impl BusSlot {
    pub fn attach(&self, bus: Arc<dyn MessageBus>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(bus);
    }

    pub fn detach(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<Arc<dyn MessageBus>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_attached(&self) -> bool {
        self.get().is_some()
    }

    /// Publish if connected. Failures are logged, not returned: callers sit on
    /// the control path and must keep going.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) -> bool {
        let Some(bus) = self.get() else {
            tracing::warn!("Bus not connected; publish to '{}' skipped", topic);
            return false;
        };
        match bus.publish(topic, payload, retain) {
            Ok(()) => {
                tracing::debug!("Published {} <- {}", topic, payload);
                true
            }
            Err(e) => {
                tracing::warn!("Publish to '{}' failed: {}", topic, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for BusSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSlot").field("attached", &self.is_attached()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_falls_back_to_text() {
        assert_eq!(decode_payload("21.5"), json!(21.5));
        assert_eq!(decode_payload("\"heat\""), json!("heat"));
        assert_eq!(decode_payload("heat"), json!("heat"));
        assert_eq!(decode_payload("{\"a\": 1}"), json!({"a": 1}));
    }

    #[test]
    fn test_empty_slot_skips_publish() {
        let slot = BusSlot::default();
        assert!(!slot.is_attached());
        assert!(!slot.publish("sensor/x/state", "1", true));
    }
}
