//! Shutdown / abort signals.
//!
//! `ShutdownTrigger` を drop しても受信側は発火しません（永遠に待つだけ）。
//! 明示的に `trigger()` したときだけ止まる、という方針です。

use tokio::sync::watch;

/// Sending half. Cheap to keep around; triggering is idempotent.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half. Clone freely; every clone observes the same trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown { rx })
    }

    pub fn trigger(&self) {
        // send_replace stores the value even with no live receivers
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired. Pending forever if the trigger
    /// was dropped without firing.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_every_clone() {
        let (trigger, shutdown) = ShutdownTrigger::new();
        let other = shutdown.clone();
        assert!(!shutdown.is_triggered());

        trigger.trigger();

        shutdown.triggered().await;
        other.triggered().await;
        assert!(other.is_triggered());
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn late_subscribers_see_the_fired_state() {
        let (trigger, _shutdown) = ShutdownTrigger::new();
        trigger.trigger();
        let late = trigger.subscribe();
        assert!(late.is_triggered());
        late.triggered().await;
    }

    #[tokio::test]
    async fn never_does_not_fire() {
        let never = Shutdown::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), never.triggered()).await;
        assert!(fired.is_err());
        assert!(!never.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_is_not_a_shutdown() {
        let (trigger, shutdown) = ShutdownTrigger::new();
        drop(trigger);
        let fired = tokio::time::timeout(Duration::from_millis(20), shutdown.triggered()).await;
        assert!(fired.is_err());
    }
}
