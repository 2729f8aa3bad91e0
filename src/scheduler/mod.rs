//! Background interval scheduler for crawler jobs.
//!
//! Mirrors the guarantees the crawl executor relies on: one instance per
//! job at a time, missed firings coalesced into one, a misfire grace
//! period, and a bounded worker pool shared by all jobs. Job loops never
//! share threads with any request-serving surface; everything runs on
//! the tokio runtime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 10;

/// Default misfire grace period.
pub const DEFAULT_MISFIRE_GRACE: Duration = Duration::from_secs(60);

/// A job body: an async closure invoked per firing.
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct JobState {
    period: Duration,
    paused: bool,
    next_run: DateTime<Utc>,
    removed: bool,
}

struct JobEntry {
    state: Arc<Mutex<JobState>>,
    wake: Arc<Notify>,
    running: Arc<AtomicBool>,
    func: JobFn,
    handle: JoinHandle<()>,
}

/// Thread-safe interval scheduler.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobEntry>>,
    workers: Arc<Semaphore>,
    misfire_grace: Duration,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_WORKERS, DEFAULT_MISFIRE_GRACE)
    }

    pub fn with_options(workers: usize, misfire_grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            misfire_grace,
            started: AtomicBool::new(false),
        }
    }

    /// Mark the scheduler started. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("Scheduler started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop all job loops. In-flight executions are left to finish.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (id, entry) in jobs.drain() {
            {
                let mut state = entry.state.lock().unwrap();
                state.removed = true;
            }
            entry.wake.notify_waiters();
            entry.handle.abort();
            debug!(job = %id, "Job loop stopped");
        }
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Scheduler shutdown");
        }
    }

    /// Add (or replace) an interval job.
    pub fn add_job(&self, job_id: &str, interval_minutes: i64, func: JobFn) {
        self.add_job_with_period(
            job_id,
            Duration::from_secs((interval_minutes.max(1) as u64) * 60),
            func,
        );
    }

    /// Add (or replace) a job with an arbitrary period.
    pub fn add_job_with_period(&self, job_id: &str, period: Duration, func: JobFn) {
        self.remove_job(job_id);

        let state = Arc::new(Mutex::new(JobState {
            period,
            paused: false,
            next_run: Utc::now() + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero()),
            removed: false,
        }));
        let wake = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(job_loop(
            job_id.to_string(),
            state.clone(),
            wake.clone(),
            running.clone(),
            func.clone(),
            self.workers.clone(),
            self.misfire_grace,
        ));

        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(
            job_id.to_string(),
            JobEntry {
                state,
                wake,
                running,
                func,
                handle,
            },
        );
        info!(job = %job_id, ?period, "Job added");
    }

    /// Remove a job. Returns true if it existed.
    pub fn remove_job(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.remove(job_id) else {
            return false;
        };
        {
            let mut state = entry.state.lock().unwrap();
            state.removed = true;
        }
        entry.wake.notify_waiters();
        entry.handle.abort();
        info!(job = %job_id, "Job removed");
        true
    }

    /// Change a job's interval; the next firing is one period from now.
    pub fn reschedule_job(&self, job_id: &str, interval_minutes: i64) -> bool {
        let period = Duration::from_secs((interval_minutes.max(1) as u64) * 60);
        self.reschedule_job_with_period(job_id, period)
    }

    pub fn reschedule_job_with_period(&self, job_id: &str, period: Duration) -> bool {
        let jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get(job_id) else {
            return false;
        };
        {
            let mut state = entry.state.lock().unwrap();
            state.period = period;
            state.next_run =
                Utc::now() + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
        }
        entry.wake.notify_waiters();
        info!(job = %job_id, ?period, "Job rescheduled");
        true
    }

    pub fn pause_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get(job_id) else {
            return false;
        };
        entry.state.lock().unwrap().paused = true;
        entry.wake.notify_waiters();
        info!(job = %job_id, "Job paused");
        true
    }

    pub fn resume_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get(job_id) else {
            return false;
        };
        {
            let mut state = entry.state.lock().unwrap();
            state.paused = false;
            state.next_run =
                Utc::now() + chrono::Duration::from_std(state.period).unwrap_or_else(|_| chrono::Duration::zero());
        }
        entry.wake.notify_waiters();
        info!(job = %job_id, "Job resumed");
        true
    }

    /// Schedule a one-shot copy of the job function immediately. The run
    /// still honors the single-instance flag and the worker pool.
    pub fn run_job_now(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get(job_id) else {
            return false;
        };
        let func = entry.func.clone();
        let running = entry.running.clone();
        let workers = self.workers.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            if running.swap(true, Ordering::SeqCst) {
                warn!(job = %id, "Immediate run skipped: already executing");
                return;
            }
            let Ok(permit) = workers.acquire_owned().await else {
                running.store(false, Ordering::SeqCst);
                return;
            };
            func().await;
            drop(permit);
            running.store(false, Ordering::SeqCst);
        });
        info!(job = %job_id, "Job triggered immediately");
        true
    }

    pub fn next_run_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs.get(job_id)?;
        let state = entry.state.lock().unwrap();
        if state.paused {
            None
        } else {
            Some(state.next_run)
        }
    }

    pub fn job_exists(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(job_id)
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, entry) in jobs.drain() {
            entry.handle.abort();
        }
    }
}

/// The per-job loop: sleep until due, coalesce missed firings, drop runs
/// while a previous instance is still executing, skip firings later than
/// the misfire grace.
async fn job_loop(
    job_id: String,
    state: Arc<Mutex<JobState>>,
    wake: Arc<Notify>,
    running: Arc<AtomicBool>,
    func: JobFn,
    workers: Arc<Semaphore>,
    misfire_grace: Duration,
) {
    loop {
        let (scheduled, paused, removed) = {
            let state = state.lock().unwrap();
            (state.next_run, state.paused, state.removed)
        };
        if removed {
            return;
        }
        if paused {
            wake.notified().await;
            continue;
        }

        let now = Utc::now();
        if scheduled > now {
            let wait = (scheduled - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wake.notified() => continue,
            }
        }

        // Due. Advance next_run strictly into the future first, collapsing
        // any missed firings into this one.
        let now = Utc::now();
        {
            let mut state = state.lock().unwrap();
            let period = chrono::Duration::from_std(state.period)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let mut next = scheduled + period;
            while next <= now {
                next += period;
            }
            state.next_run = next;
        }

        let lateness = (now - scheduled).to_std().unwrap_or_default();
        if lateness > misfire_grace {
            debug!(job = %job_id, ?lateness, "Firing missed beyond grace period, skipped");
            continue;
        }

        if running.swap(true, Ordering::SeqCst) {
            debug!(job = %job_id, "Previous instance still running, firing dropped");
            continue;
        }

        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let fut = func();
        let running = running.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            fut.await;
            drop(permit);
            running.store(false, Ordering::SeqCst);
            debug!(job = %id, "Job run finished");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: Arc<AtomicUsize>) -> JobFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn interval_job_fires_repeatedly() {
        let scheduler = Scheduler::with_options(4, Duration::from_secs(60));
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_job_with_period("tick", Duration::from_millis(20), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown();
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several firings, got {fired}");
    }

    #[tokio::test]
    async fn overlapping_firings_are_dropped() {
        let scheduler = Scheduler::with_options(4, Duration::from_secs(60));
        scheduler.start();

        let overlaps = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let overlaps_in = overlaps.clone();
        let active_in = active.clone();
        let runs_in = runs.clone();
        let job: JobFn = Arc::new(move || {
            let overlaps = overlaps_in.clone();
            let active = active_in.clone();
            let runs = runs_in.clone();
            Box::pin(async move {
                if active.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.store(false, Ordering::SeqCst);
            })
        });

        scheduler.add_job_with_period("slow", Duration::from_millis(10), job);
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.shutdown();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0, "instances overlapped");
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn pause_resume_and_remove() {
        let scheduler = Scheduler::with_options(4, Duration::from_secs(60));
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_job_with_period("pausable", Duration::from_millis(15), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(scheduler.pause_job("pausable"));
        assert!(scheduler.next_run_time("pausable").is_none());
        let at_pause = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Allow one in-flight firing at pause time, nothing more
        assert!(counter.load(Ordering::SeqCst) <= at_pause + 1);

        assert!(scheduler.resume_job("pausable"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(counter.load(Ordering::SeqCst) > at_pause);

        assert!(scheduler.remove_job("pausable"));
        assert!(!scheduler.job_exists("pausable"));
        assert!(!scheduler.remove_job("pausable"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn run_now_fires_without_waiting_for_interval() {
        let scheduler = Scheduler::with_options(4, Duration::from_secs(60));
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        // Hour-long interval: only run_job_now can fire it in this test
        scheduler.add_job_with_period("rare", Duration::from_secs(3600), counting_job(counter.clone()));

        assert!(scheduler.run_job_now("rare"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.run_job_now("missing"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn next_run_time_tracks_reschedule() {
        let scheduler = Scheduler::with_options(4, Duration::from_secs(60));
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_job_with_period("windowed", Duration::from_secs(3600), counting_job(counter));

        let first = scheduler.next_run_time("windowed").unwrap();
        assert!(first > Utc::now());

        scheduler.reschedule_job_with_period("windowed", Duration::from_secs(7200));
        let second = scheduler.next_run_time("windowed").unwrap();
        assert!(second > first);
        scheduler.shutdown();
    }
}
