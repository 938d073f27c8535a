// SPDX-License-Identifier: MIT

use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ScheduledEntry {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledEntry {
    fn stop(self) {
        self.cancellation.cancel();
        self.handle.abort();
    }
}

/// Process-wide cron scheduler for checkpoint captures, keyed by
/// `{namespace}/{name}` of the owning request. Entry replacement is atomic
/// under the map lock: the previous task is cancelled before the new one is
/// visible.
#[derive(Default)]
pub struct CheckpointScheduler {
    tasks: Mutex<HashMap<String, ScheduledEntry>>,
}

impl CheckpointScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a cron task for `key`, replacing any prior entry.
    pub fn replace<F>(&self, key: &str, schedule: Schedule, job: F)
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let cancellation = CancellationToken::new();
        let task_cancel = cancellation.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let sleeper = time::sleep(delay);
                tokio::pin!(sleeper);
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = sleeper.as_mut() => {}
                }
                if task_cancel.is_cancelled() {
                    break;
                }
                job().await;
            }
        });

        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        if let Some(previous) = tasks.insert(
            key.to_string(),
            ScheduledEntry {
                cancellation,
                handle,
            },
        ) {
            previous.stop();
        }
    }

    /// Cancel and drop the entry for `key`, if any.
    pub fn remove(&self, key: &str) {
        let removed = self
            .tasks
            .lock()
            .expect("scheduler lock poisoned")
            .remove(key);
        if let Some(entry) = removed {
            entry.stop();
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .expect("scheduler lock poisoned")
            .contains_key(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.lock().expect("scheduler lock poisoned").len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        for (_, entry) in tasks.drain() {
            entry.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn every_second() -> Schedule {
        Schedule::from_str("*/1 * * * * *").expect("cron")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_entry_fires_repeatedly() {
        let scheduler = CheckpointScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        scheduler.replace("t/cb1", every_second(), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        time::sleep(Duration::from_millis(2500)).await;
        assert!(fired.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.contains("t/cb1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replace_cancels_previous_entry() {
        let scheduler = CheckpointScheduler::new();
        let old_fires = Arc::new(AtomicUsize::new(0));
        let old_counter = old_fires.clone();

        scheduler.replace("t/cb1", every_second(), move || {
            let counter = old_counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        scheduler.replace("t/cb1", every_second(), || Box::pin(async {}));

        let frozen = old_fires.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(old_fires.load(Ordering::SeqCst), frozen);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let scheduler = CheckpointScheduler::new();
        scheduler.replace("t/cb1", every_second(), || Box::pin(async {}));
        assert!(scheduler.contains("t/cb1"));

        scheduler.remove("t/cb1");
        assert!(!scheduler.contains("t/cb1"));
        assert!(scheduler.is_empty());

        // Removing an absent key is a no-op.
        scheduler.remove("t/cb1");
    }
}
