//! Keep-alive timers layered over the task watchdog.
//!
//! While a large packet is saved, the receiver sends periodic save-data
//! notifies so the sender's watchdog does not fire. A sender that gets such a
//! notify, or that sends packets larger than the MTU, runs a feed-dog that
//! resets its own watchdog for a bounded number of intervals.

use crate::context::SyncTaskContext;
use crate::scheduler::{PeriodicHandle, TaskScheduler};
use crate::time_helper::mask_device;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Direction a feed-dog covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedDirection {
    /// Our own oversized sends.
    Send,
    /// The peer is still saving what we sent.
    Receive,
}

struct FeedDog {
    ref_count: u32,
    upper_limit: Arc<AtomicU32>,
    fed: Arc<AtomicU32>,
    handle: Option<PeriodicHandle>,
}

impl FeedDog {
    fn new() -> Self {
        Self {
            ref_count: 0,
            upper_limit: Arc::new(AtomicU32::new(0)),
            fed: Arc::new(AtomicU32::new(0)),
            handle: None,
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.ref_count = 0;
        self.fed.store(0, Ordering::Release);
    }
}

/// Ref-counted feed-dogs, one per direction.
pub(crate) struct FeedDogs {
    send: Mutex<FeedDog>,
    receive: Mutex<FeedDog>,
}

impl FeedDogs {
    pub(crate) fn new() -> Self {
        Self {
            send: Mutex::new(FeedDog::new()),
            receive: Mutex::new(FeedDog::new()),
        }
    }

    fn dog(&self, direction: FeedDirection) -> &Mutex<FeedDog> {
        match direction {
            FeedDirection::Send => &self.send,
            FeedDirection::Receive => &self.receive,
        }
    }

    /// Keeps the watchdog of `ctx` alive for about `time`. A running dog only
    /// gains a reference, a restarted count and possibly a higher limit.
    /// Returns true if a new timer was started.
    pub(crate) fn start(
        &self,
        direction: FeedDirection,
        time: Duration,
        interval: Duration,
        ctx: &Arc<SyncTaskContext>,
        scheduler: &TaskScheduler,
    ) -> bool {
        let limit = feed_limit(time, interval);
        let mut dog = self.dog(direction).lock();
        dog.ref_count += 1;
        if dog.handle.as_ref().is_some_and(PeriodicHandle::is_active) {
            dog.upper_limit.fetch_max(limit, Ordering::AcqRel);
            dog.fed.store(0, Ordering::Release);
            debug!(?direction, limit, "[StateMachine] feed-dog already running");
            return false;
        }
        dog.upper_limit.store(limit, Ordering::Release);
        dog.fed.store(0, Ordering::Release);
        let weak: Weak<SyncTaskContext> = Arc::downgrade(ctx);
        let fed = Arc::clone(&dog.fed);
        let upper = Arc::clone(&dog.upper_limit);
        let handle = scheduler.every(interval, move || {
            if fed.load(Ordering::Acquire) >= upper.load(Ordering::Acquire) {
                return;
            }
            fed.fetch_add(1, Ordering::AcqRel);
            if let Some(ctx) = weak.upgrade() {
                ctx.reset_timer();
            }
        });
        let started = handle.is_active();
        dog.handle = Some(handle);
        info!(device = %mask_device(ctx.device()), ?direction, limit,
            started, "[StateMachine] feed-dog started");
        started
    }

    /// Stops the dog regardless of its references.
    pub(crate) fn stop(&self, direction: FeedDirection) {
        self.dog(direction).lock().stop();
    }

    pub(crate) fn stop_all(&self) {
        self.stop(FeedDirection::Send);
        self.stop(FeedDirection::Receive);
    }

    /// Drops one reference; the last one stops the dog.
    pub(crate) fn dec_ref(&self, direction: FeedDirection) {
        let mut dog = self.dog(direction).lock();
        if dog.handle.is_none() {
            return;
        }
        dog.ref_count = dog.ref_count.saturating_sub(1);
        if dog.ref_count == 0 {
            dog.stop();
        }
    }

    #[cfg(test)]
    fn is_running(&self, direction: FeedDirection) -> bool {
        self.dog(direction)
            .lock()
            .handle
            .as_ref()
            .is_some_and(PeriodicHandle::is_active)
    }
}

/// Feedings that cover `time`, clamped to `u8::MAX`.
pub(crate) fn feed_limit(time: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    let count = time.as_millis() / interval.as_millis().max(1);
    count.min(u128::from(u8::MAX)) as u32
}

/// The periodic save-data notify of one inbound packet.
pub(crate) struct SaveDataNotify {
    handle: Mutex<Option<PeriodicHandle>>,
}

impl SaveDataNotify {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Runs `notify` every `interval`, at most `max_count` times. Returns false
    /// if a notify is already running.
    pub(crate) fn start(
        &self,
        scheduler: &TaskScheduler,
        interval: Duration,
        max_count: u32,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> bool {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(PeriodicHandle::is_active) {
            return false;
        }
        *slot = Some(scheduler.every_times(max_count, interval, interval, notify));
        true
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use std::thread;

    #[test]
    fn feed_limit_is_clamped() {
        let interval = Duration::from_millis(10);
        assert_eq!(feed_limit(Duration::from_millis(35), interval), 3);
        assert_eq!(feed_limit(Duration::from_secs(60), interval), 255);
        assert_eq!(feed_limit(Duration::from_secs(1), Duration::ZERO), 0);
    }

    #[test]
    fn last_reference_stops_the_dog() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let ctx = Arc::new(context());
        let dogs = FeedDogs::new();
        let interval = Duration::from_secs(60);
        assert!(dogs.start(FeedDirection::Send, interval * 4, interval, &ctx, &scheduler));
        assert!(!dogs.start(FeedDirection::Send, interval * 4, interval, &ctx, &scheduler));
        dogs.dec_ref(FeedDirection::Send);
        assert!(dogs.is_running(FeedDirection::Send));
        dogs.dec_ref(FeedDirection::Send);
        assert!(!dogs.is_running(FeedDirection::Send));
        assert!(!dogs.is_running(FeedDirection::Receive));
    }

    #[test]
    fn save_data_notify_fires_at_most_max_count() {
        let scheduler = TaskScheduler::new(16).unwrap();
        let notify = SaveDataNotify::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        assert!(notify.start(&scheduler, Duration::from_millis(5), 3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        notify.stop();
    }
}
