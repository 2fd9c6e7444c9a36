//! Timing wheel for large numbers of delayed one-shot jobs.
//!
//! Pending work is bucketed by due-tick into a fixed circular array of slots;
//! one driver thread advances the cursor once per interval and hands due jobs
//! to the elastic worker pool. Precision is bounded by one tick interval
//! either way, which makes the wheel unsuitable for sub-interval timing but
//! cheap at high fan-in: no per-task timer, no per-task thread.
//!
//! There is no per-task cancellation handle. Callers that need one encode a
//! guard check inside the job closure.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::list::{BucketList, Visit};
use crate::pool::{ElasticPool, Job};

// Upper bound on one driver sleep so `stop` is observed promptly even with
// coarse tick intervals.
const MAX_PARK: Duration = Duration::from_millis(10);

const STATE_CONSTRUCTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Wheel geometry. Validated by [`TimingWheel::new`].
#[derive(Clone, Copy, Debug)]
pub struct WheelConfig {
    /// Tick interval: how often the cursor advances.
    pub interval: Duration,
    /// Number of slots in the circular array. Fixed for the wheel's lifetime.
    pub slot_count: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            slot_count: 3600,
        }
    }
}

/// One pending unit of work. Exclusively owned by the slot it sits in until
/// executed or discarded; only the driver mutates `rotations`.
struct Task {
    rotations: u64,
    job: Job,
}

struct WheelShared {
    interval: Duration,
    slots: Box<[BucketList<Task>]>,
    current_pos: RwLock<usize>,
    pool: ElasticPool,
    state: AtomicU8,
}

impl WheelShared {
    /// Target slot and rotation count for a delay, relative to the current
    /// cursor. The `+1` bias keeps a task out of the slot currently being
    /// drained, so even a zero delay waits at least one full interval.
    fn placement(&self, delay: Duration) -> (usize, u64) {
        let ticks = (delay.as_nanos() / self.interval.as_nanos()) as u64;
        let slot_count = self.slots.len() as u64;
        let pos = *self.current_pos.read().unwrap() as u64;
        let slot = ((pos + 1 + ticks) % slot_count) as usize;
        (slot, ticks / slot_count)
    }

    /// One tick: advance the cursor, then drain the slot it landed on.
    /// Due tasks go to the pool; the rest wait out one more rotation.
    fn advance_and_drain(&self) {
        let pos = {
            let mut pos = self.current_pos.write().unwrap();
            *pos = (*pos + 1) % self.slots.len();
            *pos
        };
        let due = self.slots[pos].drain_filter(|task| {
            if task.rotations == 0 {
                Visit::Remove
            } else {
                task.rotations -= 1;
                Visit::Keep
            }
        });
        if !due.is_empty() {
            trace!(slot = pos, due = due.len(), "dispatching due tasks");
        }
        for task in due {
            self.pool.submit(task.job);
        }
    }

    fn pending(&self) -> usize {
        self.slots.iter().map(BucketList::len).sum()
    }
}

/// Hierarchical timing wheel with a single background driver.
///
/// Lifecycle is `Constructed -> Running -> Stopped`, terminal on
/// [`stop`](Self::stop); there is no restart.
pub struct TimingWheel {
    shared: Arc<WheelShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimingWheel {
    /// Create a wheel that dispatches due jobs into `pool`.
    ///
    /// Panics if the interval is zero or the slot count is zero; both are
    /// programmer errors, not recoverable runtime conditions.
    pub fn new(config: WheelConfig, pool: ElasticPool) -> Self {
        assert!(!config.interval.is_zero(), "wheel interval must be positive");
        assert!(config.slot_count > 0, "wheel slot_count must be positive");
        Self {
            shared: Arc::new(WheelShared {
                interval: config.interval,
                slots: (0..config.slot_count).map(|_| BucketList::new()).collect(),
                current_pos: RwLock::new(0),
                pool,
                state: AtomicU8::new(STATE_CONSTRUCTED),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Start the driver thread. A no-op unless the wheel is freshly
    /// constructed.
    pub fn start(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_CONSTRUCTED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("tickwheel-driver".into())
            .spawn(move || drive(shared))
            .expect("failed to spawn wheel driver");
        self.driver.lock().unwrap().replace(handle);
        debug!(
            interval_ms = self.shared.interval.as_millis() as u64,
            slots = self.shared.slots.len(),
            "timing wheel started"
        );
    }

    /// Schedule `job` to run no earlier than `delay` from now and no later
    /// than `delay` plus one interval, pool queuing aside.
    ///
    /// Does not block beyond the slot append lock. Silently dropped once the
    /// wheel has stopped.
    pub fn add_task(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if self.shared.state.load(Ordering::Acquire) == STATE_STOPPED {
            return;
        }
        let (slot, rotations) = self.shared.placement(delay);
        self.shared.slots[slot].push_back(Task {
            rotations,
            job: Box::new(job),
        });
    }

    /// Stop the wheel and close the pool. Terminal.
    ///
    /// Already-dispatched jobs finish; tasks still waiting in slots, due or
    /// not, are discarded without execution. Best-effort cancellation by
    /// design: there is no drain and no notification hook.
    pub fn stop(&self) {
        let prev = self.shared.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev == STATE_STOPPED {
            return;
        }
        if prev == STATE_RUNNING {
            if let Some(handle) = self.driver.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        // The driver is gone, so the single-consumer drain is ours to run.
        let mut discarded = 0usize;
        for slot in self.shared.slots.iter() {
            discarded += slot.drain_filter(|_| Visit::Remove).len();
        }
        if discarded > 0 {
            debug!(discarded, "discarded pending tasks on stop");
        }
        self.shared.pool.close();
    }

    /// Tasks currently waiting in slots.
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending()
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drive(shared: Arc<WheelShared>) {
    let interval = shared.interval;
    let mut next_tick = Instant::now() + interval;

    while shared.state.load(Ordering::Acquire) == STATE_RUNNING {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep((next_tick - now).min(MAX_PARK));
            continue;
        }

        shared.advance_and_drain();

        next_tick += interval;
        if next_tick <= now {
            // Fell behind (long drain or a suspended host): resynchronize
            // rather than firing a burst of catch-up ticks.
            next_tick = now + interval;
        }
    }
    trace!("wheel driver exiting");
}
