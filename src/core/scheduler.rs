// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Task scheduler for timed operations
//!
//! Tasks are spawned onto the current tokio runtime. On the coordinator's
//! current-thread runtime they therefore run on the coordinating thread,
//! interleaved with everything else at await points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Clone)]
pub struct Scheduler {
    tasks: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `task` every `interval`, first run one interval from now.
    ///
    /// Replaces any task already registered under `name`.
    pub fn every<F>(&self, name: &str, interval: Duration, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });
        self.register(name, handle.abort_handle());
        debug!("Scheduled task '{}' with interval {:?}", name, interval);
    }

    /// Run `task` once after `delay`.
    ///
    /// A pending one-shot with the same name is cancelled first.
    pub fn after<F>(&self, name: &str, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let key = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.lock().remove(&key);
            task();
        });
        self.register(name, handle.abort_handle());
        debug!("Scheduled one-shot '{}' in {:?}", name, delay);
    }

    /// Cancel the task registered under `name`. Returns whether one existed.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                debug!("Cancelled task '{}'", name);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for (name, handle) in tasks.drain() {
            handle.abort();
            debug!("Cancelled task '{}'", name);
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    fn register(&self, name: &str, handle: AbortHandle) {
        if let Some(previous) = self.tasks.lock().insert(name.to_string(), handle) {
            previous.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.after("once", Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("once"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_pending() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            scheduler.after("timer", Duration::from_secs(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_and_cancel() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        scheduler.every("tick", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel("tick"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
