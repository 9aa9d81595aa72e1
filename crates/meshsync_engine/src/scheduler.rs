//! Delayed and periodic task runner.
//!
//! One worker thread pops tasks in fire-time order and runs them outside the
//! queue lock, so a task body may schedule, reset or remove other tasks.
//! Periodic tasks re-arm themselves after each run; the time a body takes is
//! added to the period.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identifier of a scheduled task.
pub type TaskId = u64;

/// Returned when a task could not be scheduled or found.
pub const INVALID_TASK_ID: TaskId = 0;

type Task = Box<dyn FnOnce() + Send + 'static>;
type PeriodicBody = Arc<dyn Fn() + Send + Sync + 'static>;

struct Queue {
    tasks: BTreeMap<(Instant, TaskId), Task>,
    index: HashMap<TaskId, Instant>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    next_id: AtomicU64,
    capacity: usize,
}

impl Shared {
    fn at(&self, time: Instant, task: Task) -> TaskId {
        let mut queue = self.queue.lock();
        if queue.stopped {
            return INVALID_TASK_ID;
        }
        if queue.tasks.len() >= self.capacity {
            warn!(capacity = self.capacity, "[TaskScheduler] queue is full");
            return INVALID_TASK_ID;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let earliest = queue
            .tasks
            .first_key_value()
            .map_or(true, |((first, _), _)| time < *first);
        queue.tasks.insert((time, id), task);
        queue.index.insert(id, time);
        drop(queue);
        if earliest {
            self.wakeup.notify_one();
        }
        id
    }

    fn remove(&self, id: TaskId) -> Option<Task> {
        let mut queue = self.queue.lock();
        let time = queue.index.remove(&id)?;
        queue.tasks.remove(&(time, id))
    }

    fn run(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    let next = queue.tasks.first_key_value().map(|(key, _)| *key);
                    match next {
                        None if queue.stopped => return,
                        None => self.wakeup.wait(&mut queue),
                        Some((time, id)) => {
                            if time <= Instant::now() {
                                queue.index.remove(&id);
                                break queue.tasks.remove(&(time, id));
                            }
                            self.wakeup.wait_until(&mut queue, time);
                        }
                    }
                }
            };
            if let Some(task) = task {
                task();
            }
        }
    }
}

struct PeriodicState {
    current: AtomicU64,
    cancelled: AtomicBool,
}

/// Tracks the pending firing of a periodic task.
pub struct PeriodicHandle {
    first: TaskId,
    state: Arc<PeriodicState>,
    scheduler: Weak<Shared>,
}

impl PeriodicHandle {
    fn invalid() -> Self {
        Self {
            first: INVALID_TASK_ID,
            state: Arc::new(PeriodicState {
                current: AtomicU64::new(INVALID_TASK_ID),
                cancelled: AtomicBool::new(true),
            }),
            scheduler: Weak::new(),
        }
    }

    /// Id of the first firing.
    pub fn first_id(&self) -> TaskId {
        self.first
    }

    /// Id of the next pending firing, or [`INVALID_TASK_ID`] once done.
    pub fn current_id(&self) -> TaskId {
        self.state.current.load(Ordering::Acquire)
    }

    /// Returns true if the task was scheduled and has firings left.
    pub fn is_active(&self) -> bool {
        !self.state.cancelled.load(Ordering::Acquire) && self.current_id() != INVALID_TASK_ID
    }

    /// Stops further firings. A body already running completes.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let Some(shared) = self.scheduler.upgrade() {
            drop(shared.remove(self.current_id()));
        }
    }
}

/// Single-worker task scheduler with bounded capacity.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Starts a scheduler holding at most `capacity` pending tasks.
    ///
    /// # Errors
    ///
    /// Fails if the worker thread cannot be spawned.
    pub fn new(capacity: usize) -> SyncResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: BTreeMap::new(),
                index: HashMap::new(),
                stopped: false,
            }),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(1),
            capacity,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("meshsync-scheduler".into())
            .spawn(move || worker_shared.run())
            .map_err(|e| SyncError::internal(format!("spawn scheduler worker: {e}")))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Runs `task` at `time`. Returns [`INVALID_TASK_ID`] when full or stopped.
    pub fn at(&self, time: Instant, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.shared.at(time, Box::new(task))
    }

    /// Runs `task` as soon as possible.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.at(Instant::now(), task)
    }

    /// Moves a pending task to `now + interval`.
    ///
    /// Returns the unchanged id, or [`INVALID_TASK_ID`] if the task already ran
    /// or was removed.
    pub fn reset(&self, id: TaskId, interval: Duration) -> TaskId {
        let mut queue = self.shared.queue.lock();
        let Some(time) = queue.index.get(&id).copied() else {
            return INVALID_TASK_ID;
        };
        let Some(task) = queue.tasks.remove(&(time, id)) else {
            return INVALID_TASK_ID;
        };
        let next = Instant::now() + interval;
        queue.tasks.insert((next, id), task);
        queue.index.insert(id, next);
        drop(queue);
        self.shared.wakeup.notify_one();
        id
    }

    /// Cancels a pending task. No-op if it already ran.
    pub fn remove(&self, id: TaskId) {
        if id == INVALID_TASK_ID {
            return;
        }
        drop(self.shared.remove(id));
    }

    /// Runs `task` every `interval`, first after one interval.
    pub fn every(&self, interval: Duration, task: impl Fn() + Send + Sync + 'static) -> PeriodicHandle {
        self.every_after(interval, interval, task)
    }

    /// Runs `task` after `delay`, then every `interval`.
    pub fn every_after(
        &self,
        delay: Duration,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicHandle {
        self.schedule_periodic(None, delay, interval, Arc::new(task))
    }

    /// Runs `task` exactly `times` times: after `delay`, then every `interval`.
    pub fn every_times(
        &self,
        times: u32,
        delay: Duration,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicHandle {
        if times == 0 {
            return PeriodicHandle::invalid();
        }
        self.schedule_periodic(Some(times), delay, interval, Arc::new(task))
    }

    /// Drops every pending task without running it.
    pub fn clean(&self) {
        let drained = {
            let mut queue = self.shared.queue.lock();
            queue.index.clear();
            std::mem::take(&mut queue.tasks)
        };
        debug!(count = drained.len(), "[TaskScheduler] cleaned pending tasks");
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the worker. Pending tasks are dropped; a body that is running
    /// completes before this returns, unless called from that body.
    pub fn shutdown(&self) {
        let drained = {
            let mut queue = self.shared.queue.lock();
            let drained = if queue.stopped {
                BTreeMap::new()
            } else {
                queue.stopped = true;
                queue.index.clear();
                let drained = std::mem::take(&mut queue.tasks);
                let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                queue.tasks.insert((Instant::now(), id), Box::new(|| {}));
                drained
            };
            drained
        };
        self.shared.wakeup.notify_all();
        drop(drained);

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("[TaskScheduler] worker panicked");
            }
        }
    }

    fn schedule_periodic(
        &self,
        times: Option<u32>,
        delay: Duration,
        interval: Duration,
        body: PeriodicBody,
    ) -> PeriodicHandle {
        let state = Arc::new(PeriodicState {
            current: AtomicU64::new(INVALID_TASK_ID),
            cancelled: AtomicBool::new(false),
        });
        let first = arm_periodic(
            &self.shared,
            times,
            Instant::now() + delay,
            interval,
            body,
            Arc::clone(&state),
        );
        state.current.store(first, Ordering::Release);
        PeriodicHandle {
            first,
            state,
            scheduler: Arc::downgrade(&self.shared),
        }
    }
}

fn arm_periodic(
    shared: &Arc<Shared>,
    remaining: Option<u32>,
    time: Instant,
    interval: Duration,
    body: PeriodicBody,
    state: Arc<PeriodicState>,
) -> TaskId {
    let weak = Arc::downgrade(shared);
    shared.at(
        time,
        Box::new(move || {
            if state.cancelled.load(Ordering::Acquire) {
                return;
            }
            body();
            let remaining = remaining.map(|n| n.saturating_sub(1));
            if remaining == Some(0) || state.cancelled.load(Ordering::Acquire) {
                state.current.store(INVALID_TASK_ID, Ordering::Release);
                return;
            }
            if let Some(shared) = weak.upgrade() {
                let next = arm_periodic(
                    &shared,
                    remaining,
                    Instant::now() + interval,
                    interval,
                    body,
                    Arc::clone(&state),
                );
                state.current.store(next, Ordering::Release);
            }
        }),
    )
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn earlier_task_runs_first() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        let late = tx.clone();
        scheduler.at(now + ms(60), move || late.send("late").unwrap());
        scheduler.at(now + ms(10), move || tx.send("early").unwrap());

        assert_eq!(rx.recv_timeout(ms(1000)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(ms(1000)).unwrap(), "late");
    }

    #[test]
    fn capacity_is_enforced() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let far = Instant::now() + Duration::from_secs(60);
        assert_ne!(scheduler.at(far, || {}), INVALID_TASK_ID);
        assert_ne!(scheduler.at(far, || {}), INVALID_TASK_ID);

        let flag = Arc::clone(&ran);
        let id = scheduler.execute(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(id, INVALID_TASK_ID);
        thread::sleep(ms(50));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_moves_a_pending_task() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = scheduler.at(Instant::now() + Duration::from_secs(60), move || {
            tx.send(()).unwrap()
        });
        assert_eq!(scheduler.reset(id, ms(5)), id);
        rx.recv_timeout(ms(1000)).unwrap();
        assert_eq!(scheduler.reset(id, ms(5)), INVALID_TASK_ID);
    }

    #[test]
    fn removed_task_never_runs() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let id = scheduler.at(Instant::now() + ms(20), move || flag.store(true, Ordering::SeqCst));
        scheduler.remove(id);
        thread::sleep(ms(60));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn every_times_fires_exactly_n_times() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = scheduler.every_times(3, ms(1), ms(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_ne!(handle.first_id(), INVALID_TASK_ID);
        thread::sleep(ms(150));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!handle.is_active());
    }

    #[test]
    fn every_times_zero_schedules_nothing() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let handle = scheduler.every_times(0, ms(1), ms(1), || {});
        assert_eq!(handle.first_id(), INVALID_TASK_ID);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn cancelled_periodic_stops() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = scheduler.every(ms(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(ms(40));
        handle.cancel();
        let seen = count.load(Ordering::SeqCst);
        thread::sleep(ms(40));
        assert!(seen >= 1);
        assert!(count.load(Ordering::SeqCst) <= seen + 1);
    }

    #[test]
    fn task_bodies_can_reenter() {
        let scheduler = Arc::new(TaskScheduler::new(16).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&scheduler);
        scheduler.execute(move || {
            inner.execute(move || tx.send(()).unwrap());
        });
        rx.recv_timeout(ms(1000)).unwrap();
    }

    #[test]
    fn nothing_runs_after_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        {
            let scheduler = TaskScheduler::new(16).unwrap();
            let flag = Arc::clone(&ran);
            scheduler.at(Instant::now() + ms(30), move || flag.store(true, Ordering::SeqCst));
        }
        thread::sleep(ms(60));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn clean_drops_pending() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let far = Instant::now() + Duration::from_secs(60);
        scheduler.at(far, || {});
        scheduler.at(far, || {});
        assert_eq!(scheduler.len(), 2);
        scheduler.clean();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn stopped_scheduler_rejects_tasks() {
        let scheduler = TaskScheduler::new(16).unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.execute(|| {}), INVALID_TASK_ID);
        scheduler.shutdown();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn tasks_start_in_fire_time_order(delays in proptest::collection::vec(0u64..15, 1..8)) {
            let scheduler = TaskScheduler::new(64).unwrap();
            let (tx, rx) = mpsc::channel();
            let base = Instant::now() + ms(5);
            for delay in &delays {
                let time = base + ms(*delay);
                let tx = tx.clone();
                scheduler.at(time, move || tx.send(time).unwrap());
            }
            let mut seen = Vec::new();
            for _ in &delays {
                seen.push(rx.recv_timeout(ms(1000)).unwrap());
            }
            prop_assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
