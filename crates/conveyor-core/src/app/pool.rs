//! SlotPool - 同時実行数を制限する実行スロット
//!
//! - `Semaphore` の permit 1 つ = スロット 1 つ
//! - 実行中のタスクは `JoinSet` が保持し、`drain()` で全完了を待つ

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::signal::Shutdown;

pub struct SlotPool {
    permits: Arc<Semaphore>,
    running: JoinSet<()>,
    size: usize,
}

impl SlotPool {
    /// A pool of `size` slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            running: JoinSet::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Wait for a free slot and spawn `work` into it.
    ///
    /// Returns false without running `work` when `shutdown` fires first.
    pub async fn submit<F>(&mut self, work: F, shutdown: &Shutdown) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = shutdown.triggered() => return false,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                // closed semaphore: nothing will ever free a slot
                Err(_) => return false,
            },
        };

        self.running.spawn(async move {
            let _slot = permit;
            work.await;
        });
        self.reap_finished();
        true
    }

    /// Wait until every in-flight execution has finished.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            log_join_error(joined);
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            log_join_error(joined);
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "task execution panicked or was cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ShutdownTrigger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[test]
    fn zero_slots_means_one() {
        assert_eq!(SlotPool::new(0).size(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_slot_count() {
        let mut pool = SlotPool::new(2);
        let shutdown = Shutdown::never();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let submitted = pool
                .submit(
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    },
                    &shutdown,
                )
                .await;
            assert!(submitted);
        }
        pool.drain().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_waiting_submit() {
        let mut pool = SlotPool::new(1);
        let (trigger, shutdown) = ShutdownTrigger::new();
        let release = Arc::new(Notify::new());

        let held = Arc::clone(&release);
        assert!(pool.submit(async move { held.notified().await }, &shutdown).await);

        trigger.trigger();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let submitted = pool
            .submit(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &shutdown,
            )
            .await;
        assert!(!submitted);

        release.notify_one();
        pool.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
