use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

/// Shared admission point for all fetch/process work.
///
/// Enforces two bounds: a maximum number of concurrently running tasks
/// (semaphore) and a minimum interval between task starts (token spacing),
/// so the crawl stays polite towards target hosts no matter how fast the
/// frontier discovers new links.
#[derive(Debug)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    next_start: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            min_interval,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Wait for a concurrency slot and for this task's start window.
    ///
    /// Each caller reserves the next free start instant while holding the
    /// `next_start` lock, then sleeps until that instant outside the lock.
    /// Task starts are therefore spaced by at least `min_interval` even
    /// when many tasks are released by the semaphore at once.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore closed");

        let start_at = {
            let mut next = self.next_start.lock().await;
            let now = Instant::now();
            let start_at = if *next > now { *next } else { now };
            *next = start_at + self.min_interval;
            start_at
        };
        tokio::time::sleep_until(start_at).await;
        trace!("task start slot granted");
        permit
    }
}

/// Explicit per-job completion tracking.
///
/// Every scheduled task belonging to a job increments `pending` before it is
/// spawned and decrements it when it finishes, children included (a task
/// spawns its children before it reports finished, so the counter can only
/// reach zero once the whole subtree is done). `drained` resolves when the
/// counter is zero, which is the job's completion signal.
#[derive(Debug, Default)]
pub struct JobTracker {
    pending: AtomicUsize,
    notify: Notify,
}

impl JobTracker {
    pub fn task_started(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no task of this job is running or queued.
    pub async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
