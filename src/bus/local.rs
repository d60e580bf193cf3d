// src/bus/local.rs - In-process broker with retained messages
//
// Behaves like a single-client MQTT broker: retained payloads are stored per topic
// and replayed to new subscribers, and deliveries happen on the dispatcher task,
// never inside the publishing call.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{BusError, Handler, Message, MessageBus};
use crate::shutdown::ShutdownListener;

/// Messages kept for [`LocalBus::published`] unless configured otherwise.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<String, Handler>,
    retained: HashMap<String, String>,
    /// Most recent publishes, oldest first, at most `journal_capacity` long.
    journal: VecDeque<Message>,
    journal_capacity: usize,
}

impl BrokerState {
    fn record(&mut self, message: Message) {
        if self.journal_capacity == 0 {
            return;
        }
        if self.journal.len() == self.journal_capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(message);
    }
}

#[derive(Clone)]
pub struct LocalBus {
    state: Arc<Mutex<BrokerState>>,
    deliveries: mpsc::UnboundedSender<Message>,
}

/// Drains queued deliveries and runs the subscribed handler for each one.
pub struct BusDispatcher {
    state: Arc<Mutex<BrokerState>>,
    deliveries: mpsc::UnboundedReceiver<Message>,
}

impl LocalBus {
    pub fn new() -> (Self, BusDispatcher) {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    /// A capacity of 0 keeps no journal at all.
    pub fn with_journal_capacity(capacity: usize) -> (Self, BusDispatcher) {
        let state = Arc::new(Mutex::new(BrokerState { journal_capacity: capacity, ..BrokerState::default() }));
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self { state: state.clone(), deliveries: tx };
        (bus, BusDispatcher { state, deliveries: rx })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current retained payload for `topic`.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.lock().retained.get(topic).cloned()
    }

    /// The most recent publishes still in the journal, oldest first.
    pub fn published(&self) -> Vec<Message> {
        self.lock().journal.iter().cloned().collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().subscriptions.contains_key(topic)
    }

    fn enqueue(&self, message: Message) -> Result<(), BusError> {
        self.deliveries.send(message).map_err(|_| BusError::Closed)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        let message = Message { topic: topic.to_string(), payload: payload.to_string(), retained: false };
        let subscribed = {
            let mut state = self.lock();
            if retain {
                state.retained.insert(topic.to_string(), payload.to_string());
            }
            state.record(Message { retained: retain, ..message.clone() });
            state.subscriptions.contains_key(topic)
        };
        if subscribed {
            self.enqueue(message)?;
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError> {
        let replay = {
            let mut state = self.lock();
            state.subscriptions.insert(topic.to_string(), handler);
            state.retained.get(topic).cloned()
        };
        if let Some(payload) = replay {
            self.enqueue(Message { topic: topic.to_string(), payload, retained: true })?;
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.lock().subscriptions.remove(topic);
        Ok(())
    }
}

impl BusDispatcher {
    /// Deliver one message to its handler, if any is still subscribed.
    /// Handler errors and panics stop here.
    pub fn dispatch(&self, message: &Message) {
        let handler = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.subscriptions.get(&message.topic).cloned()
        };
        let Some(handler) = handler else {
            tracing::trace!("No subscriber for {}, dropping", message.topic);
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Handler for '{}' failed: {}", message.topic, e),
            Err(_) => tracing::error!("Handler for '{}' panicked", message.topic),
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownListener) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    tracing::info!("Bus dispatcher shutting down");
                    break;
                }
                message = self.deliveries.recv() => match message {
                    Some(message) => self.dispatch(&message),
                    None => break,
                },
            }
        }
    }

    /// Deliver everything queued right now. Used where no dispatcher task runs.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(message) = self.deliveries.try_recv() {
            self.dispatch(&message);
            delivered += 1;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_retained_replayed_on_subscribe() {
        let (bus, mut dispatcher) = LocalBus::new();
        bus.publish("number/dev/kp/state", "2.5", true).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "number/dev/kp/state",
            Arc::new(move |msg: &Message| {
                sink.lock().unwrap().push((msg.payload.clone(), msg.retained));
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![("2.5".to_string(), true)]);
    }

    #[test]
    fn test_unsubscribed_topic_not_delivered() {
        let (bus, mut dispatcher) = LocalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("a/set", counting_handler(count.clone())).unwrap();
        bus.publish("a/set", "1", false).unwrap();
        bus.unsubscribe("a/set").unwrap();
        dispatcher.drain();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.published_to("a/set"), vec!["1"]);
        assert_eq!(bus.retained("a/set"), None);
    }

    #[test]
    fn test_journal_is_bounded() {
        let (bus, _dispatcher) = LocalBus::with_journal_capacity(3);
        for n in 0..10 {
            bus.publish("sensor/dev/t/state", &n.to_string(), true).unwrap();
        }
        assert_eq!(bus.published_to("sensor/dev/t/state"), vec!["7", "8", "9"]);
        assert_eq!(bus.retained("sensor/dev/t/state").as_deref(), Some("9"));

        let (bus, _dispatcher) = LocalBus::with_journal_capacity(0);
        bus.publish("sensor/dev/t/state", "1", true).unwrap();
        assert!(bus.published().is_empty());
        assert_eq!(bus.retained("sensor/dev/t/state").as_deref(), Some("1"));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (bus, mut dispatcher) = LocalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("boom", Arc::new(|_msg: &Message| panic!("handler bug"))).unwrap();
        bus.subscribe("ok", counting_handler(count.clone())).unwrap();
        bus.publish("boom", "x", false).unwrap();
        bus.publish("ok", "y", false).unwrap();
        assert_eq!(dispatcher.drain(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
