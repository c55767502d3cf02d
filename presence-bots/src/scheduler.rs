//! Cancellable one-shot timers.
//!
//! Reconnect backoff, park delays and settle delays all go through the
//! [`Scheduler`] trait. Production uses [`TokioScheduler`]; tests drive a
//! [`ManualScheduler`] by hand so nothing waits on the wall clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Work to run when a timer fires.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task. Cancelling is cooperative: a cancelled task
/// simply never runs.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the task from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`TimerHandle::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has passed, unless cancelled first.
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;
}

// ---------------------------------------------------------------------------
// TokioScheduler
// ---------------------------------------------------------------------------

/// Spawns one sleeping task per timer on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule on the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule on the runtime of the calling task.
    ///
    /// # Errors
    /// Called outside a tokio runtime.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::default();
        let watch = handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !watch.is_cancelled() {
                task();
            }
        });
        handle
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler
// ---------------------------------------------------------------------------

struct Pending {
    due: Duration,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

#[derive(Default)]
struct ManualInner {
    now: Duration,
    seq: u64,
    queue: Vec<Pending>,
}

/// Virtual clock: tasks run only inside [`ManualScheduler::advance`].
#[derive(Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &inner.now)
            .field("pending", &inner.queue.len())
            .finish()
    }
}

impl ManualScheduler {
    /// Create a scheduler at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward, running every due task in due order
    /// (ties in scheduling order). Tasks scheduled by tasks run too if they
    /// fall inside the window. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.inner.lock().now + by;
        let mut ran = 0;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                inner.queue.retain(|p| !p.handle.is_cancelled());
                let earliest = inner
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.due <= target)
                    .min_by_key(|(_, p)| (p.due, p.seq))
                    .map(|(i, _)| i);
                match earliest {
                    Some(index) => {
                        let pending = inner.queue.swap_remove(index);
                        inner.now = pending.due;
                        Some(pending)
                    }
                    None => {
                        inner.now = target;
                        None
                    }
                }
            };
            // Run outside the lock: tasks schedule follow-up timers.
            match next {
                Some(pending) => {
                    (pending.task)();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Remaining delay of every live timer, shortest first.
    #[must_use]
    pub fn pending_delays(&self) -> Vec<Duration> {
        let inner = self.inner.lock();
        let mut delays: Vec<Duration> = inner
            .queue
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .map(|p| p.due.saturating_sub(inner.now))
            .collect();
        delays.sort();
        delays
    }

    /// Number of live timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending_delays().len()
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::default();
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let pending = Pending {
            due: inner.now + delay,
            seq: inner.seq,
            handle: handle.clone(),
            task,
        };
        inner.queue.push(pending);
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn manual_runs_only_due_tasks() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.after(Duration::from_secs(10), counter_task(&fired));
        scheduler.after(Duration::from_secs(30), counter_task(&fired));

        assert_eq!(scheduler.advance(Duration::from_secs(9)), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert_eq!(scheduler.pending_delays(), vec![Duration::from_secs(20)]);
        assert_eq!(scheduler.advance(Duration::from_secs(60)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.now(), Duration::from_secs(70));
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_secs(5), counter_task(&fired));
        handle.cancel();
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(10)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_can_schedule_follow_ups() {
        let scheduler = Arc::new(ManualScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let inner_scheduler = scheduler.clone();
        let inner_fired = fired.clone();
        scheduler.after(
            Duration::from_secs(1),
            Box::new(move || {
                inner_scheduler.after(Duration::from_secs(1), counter_task(&inner_fired));
            }),
        );
        assert_eq!(scheduler.advance(Duration::from_secs(5)), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_respects_cancel() {
        let scheduler = TokioScheduler::current().expect("runtime");
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.after(Duration::from_secs(1), counter_task(&fired));
        let cancelled = scheduler.after(Duration::from_secs(1), counter_task(&fired));
        cancelled.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
