//! Fire-and-forget tasks.
//!
//! Cache writes triggered while answering a fetch must not delay the
//! response. They are spawned here instead: the response path never awaits
//! them, and a failure is logged and swallowed. The set keeps the join
//! handles so a host that wants a clean shutdown (or a test that wants a
//! deterministic store) can [`drain`](TaskSet::drain) it.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A shared set of detached background tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` on the current runtime. Its error, if any, is logged under `label`.
    pub fn spawn<F, E>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap whatever already finished so the set doesn't grow unbounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match task.await {
                Ok(()) => debug!(task = label, "background task finished"),
                Err(e) => warn!(task = label, error = %e, "background task failed"),
            }
        });
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Waits for every task spawned so far, including tasks they spawn in turn.
    pub async fn drain(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "background task panicked or was cancelled");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_spawned_work() {
        let tasks = TaskSet::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            tasks.spawn("count", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), std::io::Error>(())
            });
        }
        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let tasks = TaskSet::new();
        tasks.spawn("fail", async { Err::<(), _>("disk full") });
        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }
}
