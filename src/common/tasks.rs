// Uniform lifecycle for background loops.
//
// Every periodic job (heartbeat, health scan, rebalance, archiver, metrics,
// quota sync, KV maintenance) is a cancellable task registered in a
// TaskGroup. The owning component calls `shutdown()` in its stop path and
// returns only after every task has observed the signal and exited.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cancellation signal handed to every background task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Wrap a raw watch receiver, for tasks spawned outside a TaskGroup.
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // The sender is held by the TaskGroup; a closed channel also means
        // the owner is gone and the task must exit.
        let _ = self.rx.changed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Owns a set of cancellable tasks and their completion signals.
pub struct TaskGroup {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            rx,
            tasks: Vec::new(),
        }
    }

    /// Spawn a named task. The factory receives the group's shutdown signal.
    pub fn spawn<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Shutdown {
            rx: self.rx.clone(),
        };
        let handle = tokio::spawn(factory(shutdown));
        self.tasks.push((name.to_string(), handle));
    }

    /// Spawn a task that runs `tick` every `period` until shutdown.
    ///
    /// The first tick fires after one full period, not immediately.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.to_string();
        self.spawn(name, move |mut shutdown| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(task = %task_name, "background task stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }
        });
    }

    /// Request cancellation and await every task's completion signal.
    pub async fn shutdown(&mut self) {
        let _ = self.tx.send(true);
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(task = %name, error = %e, "background task panicked");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_stops_periodic_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new();
        let c = counter.clone();
        group.spawn_periodic("ticker", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        group.shutdown().await;
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected a few ticks, got {}", ticks);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_spawned_task_sees_cancellation() {
        let mut group = TaskGroup::new();
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        group.spawn("waiter", move |mut shutdown| async move {
            shutdown.cancelled().await;
            f.store(1, Ordering::SeqCst);
        });
        group.shutdown().await;
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
