//! Delayed work for the broker actor, injectable so fill latency can be
//! driven by hand in tests.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Handle to one scheduled job. Canceling is idempotent and a canceled job
/// never runs.
#[derive(Debug)]
pub struct ScheduledJob {
    canceled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl ScheduledJob {
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, job: BoxFuture<'static, ()>) -> ScheduledJob;
}

/// Runs each job on its own tokio task after `delay`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: BoxFuture<'static, ()>) -> ScheduledJob {
        let canceled = Arc::new(AtomicBool::new(false));
        let flag = canceled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                job.await;
            }
        });
        ScheduledJob {
            canceled,
            abort: Some(handle.abort_handle()),
        }
    }
}

struct PendingJob {
    due: Duration,
    canceled: Arc<AtomicBool>,
    job: BoxFuture<'static, ()>,
}

/// Scheduler whose clock only moves through [`ManualScheduler::advance`].
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    pending: Vec<PendingJob>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs scheduled and neither run nor canceled yet.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .pending
                    .iter()
                    .filter(|pending| !pending.canceled.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Moves time forward and runs every job that came due, earliest first.
    pub async fn advance(&self, by: Duration) {
        let due = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.elapsed += by;
            let now = state.elapsed;
            let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|pending| pending.due <= now);
            state.pending = waiting;
            due.sort_by_key(|pending| pending.due);
            due
        };
        for pending in due {
            if !pending.canceled.load(Ordering::SeqCst) {
                pending.job.await;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, job: BoxFuture<'static, ()>) -> ScheduledJob {
        let canceled = Arc::new(AtomicBool::new(false));
        if let Ok(mut state) = self.state.lock() {
            let due = state.elapsed + delay;
            state.pending.push(PendingJob {
                due,
                canceled: canceled.clone(),
                job,
            });
        }
        ScheduledJob {
            canceled,
            abort: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> BoxFuture<'static, ()> {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_manual_scheduler_runs_only_due_jobs() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Duration::from_millis(100), counting(&counter));
        scheduler.schedule(Duration::from_millis(300), counting(&counter));

        scheduler.advance(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1);

        scheduler.advance(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_canceled_job_never_runs() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job = scheduler.schedule(Duration::from_millis(10), counting(&counter));
        job.cancel();
        assert!(job.is_canceled());
        assert_eq!(scheduler.pending(), 0);

        scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_waits_for_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        TokioScheduler.schedule(Duration::from_millis(500), counting(&counter));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let job = TokioScheduler.schedule(Duration::from_millis(500), counting(&counter));
        job.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
