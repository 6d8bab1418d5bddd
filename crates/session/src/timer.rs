//! Message/timer thread (§4.10), reimagined as a `tokio::time`-driven timer
//! wheel: a `BinaryHeap` of scheduled closures behind a mutex, drained by a
//! single dedicated task. `post`/`cancel`/`cancel_self` keep the external
//! contract of the original single-thread priority queue even though the
//! backing primitive is now an async task rather than a platform thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type TimerId = u64;

type Closure = Box<dyn FnMut() + Send + 'static>;

struct ScheduledTask {
    run_at: Instant,
    id: TimerId,
    period: Option<Duration>,
    closure: Closure,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.id == other.id
    }
}
impl Eq for ScheduledTask {}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other.run_at.cmp(&self.run_at).then_with(|| other.id.cmp(&self.id))
    }
}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<ScheduledTask>,
    cancelled: std::collections::HashSet<TimerId>,
}

/// A single dedicated task draining a priority queue of scheduled closures.
/// Clone-and-share via `Arc`; dropping every clone stops the driver task on
/// its next wakeup.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    wake: Arc<Notify>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { heap: BinaryHeap::new(), cancelled: Default::default() })),
            next_id: Arc::new(AtomicU64::new(1)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Schedules `closure` to run after `delay`, repeating every `period` if
    /// given. Returns an id usable with [`TimerWheel::cancel`].
    pub fn post<F>(&self, closure: F, delay: Duration, period: Option<Duration>) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let run_at = Instant::now() + delay;
        {
            let mut inner = self.inner.lock();
            inner.heap.push(ScheduledTask { run_at, id, period, closure: Box::new(closure) });
        }
        self.wake.notify_one();
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.inner.lock().cancelled.insert(id);
        self.wake.notify_one();
    }

    /// Spawns the driver task. Must be called once per `TimerWheel`
    /// (typically from `Session::start`); the returned handle is aborted on
    /// shutdown per the cancellation sequence in §5.
    pub fn spawn_driver(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            loop {
                let next_deadline = {
                    let guard = inner.lock();
                    guard.heap.peek().map(|t| t.run_at)
                };

                match next_deadline {
                    None => wake.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = wake.notified() => continue,
                        }
                    }
                }

                let due = {
                    let mut guard = inner.lock();
                    let mut due = Vec::new();
                    let now = Instant::now();
                    while let Some(top) = guard.heap.peek() {
                        if top.run_at > now {
                            break;
                        }
                        let task = guard.heap.pop().unwrap();
                        if guard.cancelled.remove(&task.id) {
                            continue;
                        }
                        due.push(task);
                    }
                    due
                };

                for mut task in due {
                    (task.closure)();
                    if let Some(period) = task.period {
                        let mut guard = inner.lock();
                        if !guard.cancelled.contains(&task.id) {
                            task.run_at = Instant::now() + period;
                            guard.heap.push(task);
                        }
                    }
                }
            }
        })
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AO};

    #[tokio::test(start_paused = true)]
    async fn one_shot_closure_runs_once() {
        let wheel = TimerWheel::new();
        let _driver = wheel.spawn_driver();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        wheel.post(move || { count2.fetch_add(1, AO::SeqCst); }, Duration::from_millis(10), None);

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(AO::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_closure_runs_repeatedly() {
        let wheel = TimerWheel::new();
        let _driver = wheel.spawn_driver();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        wheel.post(move || { count2.fetch_add(1, AO::SeqCst); }, Duration::from_millis(10), Some(Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(count.load(AO::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_run() {
        let wheel = TimerWheel::new();
        let _driver = wheel.spawn_driver();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = wheel.post(move || { count2.fetch_add(1, AO::SeqCst); }, Duration::from_millis(10), None);
        wheel.cancel(id);

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(AO::SeqCst), 0);
    }
}
