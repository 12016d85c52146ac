use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::index::vault_key;
use super::lock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleKey {
    Sync(String),
    Vectorize(String, String),
}

impl ScheduleKey {
    pub fn sync(vault: &Path) -> Self {
        ScheduleKey::Sync(vault_key(vault))
    }

    pub fn vectorize(vault: &Path, relative_path: &str) -> Self {
        ScheduleKey::Vectorize(vault_key(vault), relative_path.to_string())
    }

    fn vault(&self) -> &str {
        match self {
            ScheduleKey::Sync(vault) | ScheduleKey::Vectorize(vault, _) => vault,
        }
    }
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

type Timers = Arc<Mutex<HashMap<ScheduleKey, Timer>>>;

/// Debounced jobs keyed by what they act on. Scheduling a key again restarts
/// its quiet period. A timer that has fired leaves the map, so cancelling
/// never interrupts a job that is already running.
#[derive(Default)]
pub struct Scheduler {
    timers: Timers,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, key: ScheduleKey, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        let mut guard = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = lock(&timers);
                if timers.get(&task_key).is_some_and(|timer| timer.id == id) {
                    timers.remove(&task_key);
                }
            }
            job.await;
        });
        if let Some(previous) = guard.insert(key, Timer { id, handle }) {
            previous.handle.abort();
        }
    }

    pub fn schedule_sync<F>(&self, vault: &Path, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(ScheduleKey::sync(vault), delay, job);
    }

    pub fn schedule_vectorize<F>(&self, vault: &Path, relative_path: &str, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(ScheduleKey::vectorize(vault, relative_path), delay, job);
    }

    pub fn cancel(&self, key: &ScheduleKey) -> bool {
        match lock(&self.timers).remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_vectorize(&self, vault: &Path, relative_path: &str) -> bool {
        self.cancel(&ScheduleKey::vectorize(vault, relative_path))
    }

    /// Drops every timer belonging to `vault`, sync and vectorize alike.
    pub fn cancel_vault(&self, vault: &Path) -> usize {
        let vault = vault_key(vault);
        let mut timers = lock(&self.timers);
        let keys: Vec<ScheduleKey> = timers
            .keys()
            .filter(|key| key.vault() == vault)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(timer) = timers.remove(key) {
                timer.handle.abort();
            }
        }
        keys.len()
    }

    pub fn shutdown(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &ScheduleKey) -> bool {
        lock(&self.timers).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_job(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_the_quiet_period() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let vault = Path::new("/vault");

        scheduler.schedule_sync(vault, Duration::from_secs(2), counter_job(&runs));
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.schedule_sync(vault, Duration::from_secs(2), counter_job(&runs));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_vectorize_leaves_sync_alone() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let vault = Path::new("/vault");

        scheduler.schedule_sync(vault, Duration::from_secs(1), counter_job(&runs));
        scheduler.schedule_vectorize(vault, "a.md", Duration::from_secs(1), counter_job(&runs));
        assert!(scheduler.cancel_vectorize(vault, "a.md"));
        assert!(!scheduler.cancel_vectorize(vault, "a.md"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_vault_only_touches_that_vault() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let one = Path::new("/one");
        let two = Path::new("/two");

        scheduler.schedule_sync(one, Duration::from_secs(1), counter_job(&runs));
        scheduler.schedule_vectorize(one, "a.md", Duration::from_secs(1), counter_job(&runs));
        scheduler.schedule_sync(two, Duration::from_secs(1), counter_job(&runs));

        assert_eq!(scheduler.cancel_vault(one), 2);
        assert!(scheduler.is_scheduled(&ScheduleKey::sync(two)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_sync(Path::new("/one"), Duration::from_secs(1), counter_job(&runs));
        scheduler.schedule_vectorize(
            Path::new("/one"),
            "a.md",
            Duration::from_secs(1),
            counter_job(&runs),
        );

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_does_not_interrupt_job() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let job_runs = Arc::clone(&runs);
        let vault = Path::new("/vault");

        scheduler.schedule_sync(vault, Duration::from_millis(10), async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            job_runs.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.cancel_vault(vault), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
