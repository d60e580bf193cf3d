// src/shutdown.rs - Process-wide cooperative shutdown
use tokio::sync::watch;

/// Owner side of the shutdown signal. Cloning is cheap; any clone may trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Listener side handed to each long-lived task at construction.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        if !*self.tx.borrow() {
            tracing::info!("Shutdown requested, stopping tasks");
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. Returns immediately if it already was,
    /// and also if every `Shutdown` handle has been dropped.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_observes_trigger_issued_before_subscribe() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut listener = shutdown.subscribe();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_millis(10), listener.triggered())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn every_listener_wakes() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = a.clone();
        let waiter = tokio::spawn(async move {
            a.triggered().await;
            b.triggered().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("listeners woke")
            .unwrap();
    }
}
