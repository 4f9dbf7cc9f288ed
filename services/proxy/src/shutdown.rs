//! Shutdown broadcast for background loops and connections

use tokio::sync::watch;

/// Sending half, held by the binary
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // No receivers left means everything already stopped.
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested or the trigger is dropped
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Raw receiver for components outside this crate
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let (trigger, signal) = channel();
        let mut waiter = signal.clone();
        assert!(!signal.is_shutdown());

        let handle = tokio::spawn(async move { waiter.wait().await });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_resolves_when_trigger_dropped() {
        let (trigger, mut signal) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let (trigger, _signal) = channel();
        trigger.trigger();
        let mut late = trigger.subscribe();
        assert!(late.is_shutdown());
        late.wait().await;
    }
}
