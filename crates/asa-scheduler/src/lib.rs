// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type BoxedJob = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Registered {
    task: JoinHandle<()>,
    job: BoxedJob,
}

/// An async named-job registry.
///
/// Each job is coalesced against itself: if a scheduled fire occurs
/// while the previous invocation of the *same* job is still running,
/// the new fire is skipped rather than queued.
#[derive(Default)]
pub struct Scheduler {
    jobs: HashMap<String, Registered>,
}

impl Scheduler {
    /// Build an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that runs every `interval`, starting after the
    /// first `interval` elapses (not immediately). Replaces any
    /// previously registered job with the same `id`.
    pub fn add<F, Fut>(&mut self, id: &str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedJob = Arc::new(move || Box::pin(job()));
        self.spawn_interval(id, every, boxed);
    }

    /// Alias for [`Self::add`], matching the common name used elsewhere
    /// in the workspace for registering a recurring job.
    pub fn every<F, Fut>(&mut self, id: &str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(id, every, job);
    }

    fn spawn_interval(&mut self, id: &str, interval: Duration, boxed: BoxedJob) {
        self.cancel_job(id);
        let running = Arc::new(Mutex::new(()));
        let name = id.to_string();
        let job_for_task = boxed.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(guard) = running.try_lock() else {
                    debug!(job = %name, "skipping fire: previous invocation still running");
                    continue;
                };
                job_for_task().await;
                drop(guard);
            }
        });

        self.jobs.insert(id.to_string(), Registered { task, job: boxed });
    }

    /// Register a job that runs once after `delay`. When
    /// `replace_existing` is true, a previously registered job under the
    /// same `id` is cancelled first.
    pub fn add_once<F, Fut>(&mut self, id: &str, delay: Duration, replace_existing: bool, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if replace_existing {
            self.cancel_job(id);
        }
        let name = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(job = %name, "firing one-shot job");
            job().await;
        });
        // One-shot jobs have no recurring factory to reuse on reschedule.
        let noop: BoxedJob = Arc::new(|| Box::pin(async {}));
        self.jobs.insert(id.to_string(), Registered { task, job: noop });
    }

    /// Convenience wrapper kept for call sites that don't care about
    /// replace semantics; always replaces.
    pub fn once<F, Fut>(&mut self, id: &str, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_once(id, delay, true, job);
    }

    /// Re-register an existing interval job under a new period, reusing
    /// its stored job closure. No-op if `id` is unknown.
    pub fn reschedule(&mut self, id: &str, every: Duration) {
        let Some(job) = self.jobs.get(id).map(|r| r.job.clone()) else {
            warn!(job = id, "reschedule requested for unknown job");
            return;
        };
        self.spawn_interval(id, every, job);
    }

    /// Cancel and remove a single job by id. No-op if unknown.
    pub fn remove(&mut self, id: &str) {
        self.cancel_job(id);
    }

    fn cancel_job(&mut self, id: &str) {
        if let Some(existing) = self.jobs.remove(id) {
            existing.task.abort();
        }
    }

    /// Run `job` immediately, once, outside the scheduled loop (e.g. an
    /// initial sync before the first interval tick).
    pub async fn run_once_now<Fut>(job: impl FnOnce() -> Fut) -> Fut::Output
    where
        Fut: Future,
    {
        job().await
    }

    /// Cancel every registered job. `wait` is accepted for call-site
    /// symmetry with a graceful-stop flag, but this scheduler's jobs are
    /// coalesced and cooperative, so in-flight invocations are simply
    /// aborted rather than awaited.
    pub fn stop(self, _wait: bool) {
        self.shutdown();
    }

    /// Cancel every registered job.
    pub fn shutdown(self) {
        for (_, registered) in self.jobs {
            registered.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn every_fires_on_interval() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler.every("tick", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler.once("startup", Duration::from_millis(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn coalesces_overlapping_fires() {
        let concurrent = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let max_concurrent_hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut scheduler = Scheduler::new();
        let concurrent2 = concurrent.clone();
        let hit2 = max_concurrent_hit.clone();
        scheduler.every("slow", Duration::from_millis(5), move || {
            let concurrent = concurrent2.clone();
            let hit = hit2.clone();
            async move {
                if concurrent.swap(true, Ordering::SeqCst) {
                    hit.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                concurrent.store(false, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!max_concurrent_hit.load(Ordering::SeqCst));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_job() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler.every("tick", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        scheduler.remove("tick");
        let seen = counter.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_changes_period() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler.every("tick", Duration::from_millis(100), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.reschedule("tick", Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown();
    }
}
