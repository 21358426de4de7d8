//! Cooperative shutdown.
//!
//! One [`Shutdown`] is created per run. Every task holds a
//! [`ShutdownSignal`] and stops at its next safe point once the signal
//! fires.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owner side of the shutdown signal. Clones trigger the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Asks every task to stop.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            log::debug!("Shutdown requested");
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver for this signal.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Triggers this shutdown on Ctrl+C.
    #[must_use]
    pub fn on_ctrl_c(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Interrupt received, finishing the current batch...");
                    shutdown.trigger();
                }
                Err(e) => log::error!("Failed to listen for Ctrl+C: {e}"),
            }
        })
    }
}

/// Receiver side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        // A dropped sender means the owner is gone, which is also a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn every_signal_observes_the_trigger() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.signal();
        let b = shutdown.signal();
        assert!(!a.is_triggered());

        let waiter = tokio::spawn(async move {
            a.wait().await;
        });
        shutdown.clone().trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(b.is_triggered());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn signal_created_after_trigger_is_already_set() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut late = shutdown.signal();
        assert!(late.is_triggered());
        late.wait().await;
    }
}
