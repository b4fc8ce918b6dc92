//! Periodic job scheduling.
//!
//! A [`Scheduler`] runs a task every `period` until its [`JobHandle`] is
//! cancelled. Each job runs at most one invocation at a time: the next tick
//! is only awaited once the previous invocation returned, and ticks missed in
//! the meantime are skipped rather than queued.
//!
//! Cancellation is synchronous with respect to delivery. A task wraps its
//! side effect in [`JobToken::enter`]; once [`JobHandle::cancel`] returns,
//! no further `enter` succeeds and any guard taken before has been dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A periodic task. Called once per tick with the job's token.
pub type Task = Box<dyn FnMut(JobToken) -> BoxFuture<'static, ()> + Send + 'static>;

/// Runs periodic tasks.
pub trait Scheduler: Send + Sync {
    /// Start running `task` every `every`. The first run happens immediately.
    fn schedule(&self, every: Duration, task: Task) -> JobHandle;
}

/// Cancellation state shared by a job and its handle.
#[derive(Debug, Clone, Default)]
pub struct JobToken {
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl JobToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Permission to perform the job's side effect, or `None` once the job
    /// is cancelled. Hold the guard for the duration of the side effect and
    /// do not await while holding it.
    pub fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.cancel.is_cancelled() {
            None
        } else {
            Some(guard)
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
        // wait out a side effect already in progress
        drop(self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }
}

/// Handle to a scheduled job. Dropping the handle cancels the job.
#[derive(Debug)]
pub struct JobHandle {
    token: JobToken,
    task: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn new(token: JobToken, task: Option<JoinHandle<()>>) -> Self {
        Self { token, task }
    }

    /// Stop the job. After this returns the task performs no further side
    /// effects.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &JobToken {
        &self.token
    }

    /// Cancel and wait for the job's task to finish.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Scheduler backed by tokio timers, one task per job.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, every: Duration, mut task: Task) -> JobHandle {
        let token = JobToken::new();
        let job_token = token.clone();

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = job_token.cancelled() => break,
                    _ = interval.tick() => {
                        if job_token.is_cancelled() {
                            break;
                        }
                        task(job_token.clone()).await;
                    }
                }
            }
            debug!("Job stopped");
        });

        JobHandle::new(token, Some(join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: Arc<AtomicUsize>) -> Task {
        Box::new(move |token: JobToken| {
            let counter = counter.clone();
            async move {
                if token.enter().is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_job_runs_periodically() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioScheduler.schedule(Duration::from_millis(50), counting_task(counter.clone()));

        tokio::time::sleep(Duration::from_millis(275)).await;
        handle.shutdown().await;

        let runs = counter.load(Ordering::SeqCst);
        assert!((4..=7).contains(&runs), "unexpected run count {}", runs);
    }

    #[tokio::test]
    async fn test_no_runs_after_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioScheduler.schedule(Duration::from_millis(20), counting_task(counter.clone()));

        tokio::time::sleep(Duration::from_millis(70)).await;
        handle.cancel();
        let at_cancel = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), at_cancel);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_slow_task_never_overlaps() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (r, m) = (running.clone(), max_seen.clone());

        let task: Task = Box::new(move |_token: JobToken| {
            let (r, m) = (r.clone(), m.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                r.fetch_sub(1, Ordering::SeqCst);
            }
            .boxed()
        });

        let handle = TokioScheduler.schedule(Duration::from_millis(10), task);
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioScheduler.schedule(Duration::from_millis(20), counting_task(counter.clone()));
        let token = handle.token().clone();
        drop(handle);

        assert!(token.is_cancelled());
        assert!(token.enter().is_none());
    }
}
