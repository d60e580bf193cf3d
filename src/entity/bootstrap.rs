// src/entity/bootstrap.rs - Recover persisted state from retained bus messages
//
// On connect every commandable field subscribes to its own state topic. The broker
// replays the retained value (if any); the first one to arrive is adopted and the
// subscription dropped so later self-publishes don't loop back. If nothing arrives
// within the fallback delay, the in-memory default is published instead and becomes
// the persisted value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::bus::{BusError, Message, MessageBus};

/// A one-shot closure run after a delay unless cancelled first.
#[derive(Debug, Clone)]
pub struct DelayedTask {
    handle: AbortHandle,
}

impl DelayedTask {
    /// Must be called inside a tokio runtime.
    pub fn spawn<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { handle: task.abort_handle() }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run the retained-state protocol for one state topic.
///
/// Exactly one of `on_retained` / `on_fallback` runs, once.
pub fn bootstrap_state<L, F>(
    bus: &Arc<dyn MessageBus>,
    state_topic: &str,
    fallback_after: Duration,
    on_retained: L,
    on_fallback: F,
) -> Result<DelayedTask, BusError>
where
    L: Fn(&Message) + Send + Sync + 'static,
    F: FnOnce() + Send + 'static,
{
    let settled = Arc::new(AtomicBool::new(false));
    let weak_bus = Arc::downgrade(bus);

    let fallback = {
        let settled = settled.clone();
        let weak_bus = weak_bus.clone();
        let topic = state_topic.to_string();
        DelayedTask::spawn(fallback_after, move || {
            if settled.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(bus) = weak_bus.upgrade() {
                if let Err(e) = bus.unsubscribe(&topic) {
                    tracing::warn!("Unsubscribe from {} failed: {}", topic, e);
                }
            }
            tracing::debug!("No retained state on {}, publishing default", topic);
            on_fallback();
        })
    };

    let timer = fallback.clone();
    let loader = Arc::new(move |msg: &Message| {
        if settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        timer.cancel();
        tracing::debug!("Loaded retained state {} = {:?}", msg.topic, msg.payload);
        on_retained(msg);
        match weak_bus.upgrade() {
            Some(bus) => bus.unsubscribe(&msg.topic),
            None => Ok(()),
        }
    });
    bus.subscribe(state_topic, loader)?;
    Ok(fallback)
}
