//! Elastic worker pool: bounded concurrency with shrink-on-demand.
//!
//! Capacity is a channel of unit tokens sized to the concurrency cap; holding
//! a token is holding one capacity slot for the lifetime of one worker.
//! Admission races queue space against a fresh token, and shrinking swaps the
//! shared idle-exit gate so only currently-idle workers observe it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{
    Receiver, Select, Sender, TryRecvError, TrySendError, bounded, select,
};
use tracing::{debug, trace};

/// A unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error returned by [`ElasticPool::submit_timeout`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The deadline fired before the pool could accept the job.
    #[error("submission deadline exceeded before the pool could accept the job")]
    DeadlineExceeded,
    /// The pool was closed.
    #[error("worker pool is closed")]
    Closed,
}

/// Pool sizing. Validated by [`ElasticPool::new`].
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Hard cap on concurrently live workers.
    pub capacity: usize,
    /// Bounded handoff queue length. Zero means rendezvous handoff only.
    pub queue_size: usize,
    /// Workers spawned up front.
    pub initial_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            queue_size: 64,
            initial_workers: 1,
        }
    }
}

/// Swappable idle-exit gate. Workers block on a clone of `rx` while idle;
/// dropping `_keeper` disconnects every clone of that generation at once.
struct IdleGate {
    _keeper: Sender<()>,
    rx: Receiver<()>,
}

impl IdleGate {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { _keeper: tx, rx }
    }
}

struct PoolShared {
    tokens: Receiver<()>,
    token_return: Sender<()>,
    work_rx: Receiver<Job>,
    // Taken on close so the queue disconnects once in-flight submits finish.
    work_tx: Mutex<Option<Sender<Job>>>,
    idle: Mutex<IdleGate>,
    live: AtomicUsize,
}

/// Bounded-concurrency executor with on-demand spawn and shrink-on-demand.
///
/// Cloning the handle is cheap; all clones share one pool.
#[derive(Clone)]
pub struct ElasticPool {
    shared: Arc<PoolShared>,
}

impl ElasticPool {
    /// Create a pool and spawn `initial_workers` standing workers.
    ///
    /// Panics on misconfiguration: zero capacity, `initial_workers` above
    /// capacity, or a non-empty queue with zero standing workers (which could
    /// starve indefinitely). These are programmer errors, not runtime
    /// conditions.
    pub fn new(config: PoolConfig) -> Self {
        assert!(config.capacity > 0, "pool capacity must be positive");
        assert!(
            config.initial_workers <= config.capacity,
            "initial_workers must not exceed capacity"
        );
        assert!(
            config.initial_workers > 0 || config.queue_size == 0,
            "a non-empty queue needs at least one standing worker"
        );

        let (token_return, tokens) = bounded(config.capacity);
        for _ in 0..config.capacity {
            token_return.send(()).unwrap();
        }
        let (work_tx, work_rx) = bounded(config.queue_size);

        let pool = Self {
            shared: Arc::new(PoolShared {
                tokens,
                token_return,
                work_rx,
                work_tx: Mutex::new(Some(work_tx)),
                idle: Mutex::new(IdleGate::new()),
                live: AtomicUsize::new(0),
            }),
        };

        for _ in 0..config.initial_workers {
            pool.shared.tokens.try_recv().unwrap();
            pool.spawn_worker(None);
        }
        debug!(
            capacity = config.capacity,
            queue_size = config.queue_size,
            initial_workers = config.initial_workers,
            "worker pool started"
        );
        pool
    }

    /// Submit a job, waiting without bound for admission.
    ///
    /// Admission is three-tiered: a non-blocking enqueue, then a race between
    /// queue space freeing and a capacity token becoming available (a won
    /// token spawns a worker that runs the job immediately). Failure to
    /// schedule is unrecoverable; submitting to a closed pool panics.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(err) = self.schedule(Box::new(job), None) {
            panic!("worker pool cannot accept work: {err}");
        }
    }

    /// Like [`submit`](Self::submit), but gives up once `timeout` elapses
    /// while still waiting for admission. A job already handed off is never
    /// aborted by the deadline.
    pub fn submit_timeout(
        &self,
        job: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> Result<(), SubmitError> {
        self.schedule(Box::new(job), Some(timeout))
    }

    fn schedule(&self, job: Job, timeout: Option<Duration>) -> Result<(), SubmitError> {
        let work_tx = {
            let guard = self.shared.work_tx.lock().unwrap();
            guard.clone().ok_or(SubmitError::Closed)?
        };

        // Tier 1: room in the queue right now.
        let job = match work_tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(_)) => return Err(SubmitError::Closed),
        };

        // Tiers 2/3: race queue space against a fresh capacity token.
        let mut sel = Select::new();
        let send_index = sel.send(&work_tx);
        let token_index = sel.recv(&self.shared.tokens);
        let oper = match timeout {
            Some(timeout) => sel
                .select_timeout(timeout)
                .map_err(|_| SubmitError::DeadlineExceeded)?,
            None => sel.select(),
        };
        match oper.index() {
            i if i == send_index => match oper.send(&work_tx, job) {
                Ok(()) => Ok(()),
                Err(_) => Err(SubmitError::Closed),
            },
            i if i == token_index => match oper.recv(&self.shared.tokens) {
                Ok(()) => {
                    // Token won: a new worker runs the job immediately, then
                    // keeps servicing the queue until idle.
                    self.spawn_worker(Some(job));
                    Ok(())
                }
                Err(_) => Err(SubmitError::Closed),
            },
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Ask currently-idle workers to exit.
    ///
    /// Swaps the idle-exit gate for a fresh one and disconnects the old
    /// generation. Workers mid-job are unaffected: they only pick up the gate
    /// again after finishing, by which time they see the fresh, open one.
    pub fn shrink(&self) {
        let old = {
            let mut gate = self.shared.idle.lock().unwrap();
            std::mem::replace(&mut *gate, IdleGate::new())
        };
        drop(old);
        debug!("pool shrink requested");
    }

    /// Close the work queue. Workers drain remaining jobs, then exit.
    /// Submitting after close is a caller error.
    pub fn close(&self) {
        if self.shared.work_tx.lock().unwrap().take().is_some() {
            debug!("worker pool closed");
        }
    }

    /// Number of currently live workers (gauge; racy by nature).
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self, first: Option<Job>) {
        let shared = Arc::clone(&self.shared);
        shared.live.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name("tickwheel-worker".into())
            .spawn(move || worker_loop(shared, first))
            .expect("failed to spawn pool worker");
    }
}

fn worker_loop(shared: Arc<PoolShared>, first: Option<Job>) {
    trace!("pool worker starting");
    if let Some(job) = first {
        job();
    }
    loop {
        // Fast path: pending work, no need to consult the idle gate.
        match shared.work_rx.try_recv() {
            Ok(job) => {
                job();
                continue;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        // Momentarily idle: race new work against the current shrink signal.
        // The gate is re-read each time so a generation swap is observed.
        let idle_rx = shared.idle.lock().unwrap().rx.clone();
        select! {
            recv(shared.work_rx) -> msg => match msg {
                Ok(job) => job(),
                // Queue closed and fully drained.
                Err(_) => break,
            },
            // The gate never carries messages; readiness means disconnect.
            recv(idle_rx) -> _ => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::Relaxed);
    let _ = shared.token_return.send(());
    trace!("pool worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_executes_submitted_jobs() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 2,
            queue_size: 8,
            initial_workers: 1,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_for(
            || counter.load(Ordering::SeqCst) == 20,
            Duration::from_secs(5),
        ));
        pool.close();
    }

    #[test]
    fn test_concurrent_submitters_no_loss_no_duplication() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 4,
            queue_size: 16,
            initial_workers: 2,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let counter = Arc::clone(&counter);
                    pool.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wait_for(
            || counter.load(Ordering::SeqCst) == 400,
            Duration::from_secs(5),
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 400);
        pool.close();
    }

    #[test]
    fn test_saturated_zero_queue_blocks_submitter_until_slot_frees() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 1,
            queue_size: 0,
            initial_workers: 1,
        });

        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(0);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        // Pool is saturated: one worker busy, no queue, no spare capacity.
        let (done_tx, done_rx) = bounded::<()>(1);
        let submitter = {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.submit(move || {
                    done_tx.send(()).unwrap();
                });
            })
        };

        // The second submit must still be blocked.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        submitter.join().unwrap();
        pool.close();
    }

    #[test]
    fn test_queue_absorbs_excess_before_blocking() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 1,
            queue_size: 3,
            initial_workers: 1,
        });

        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(0);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        // Worker busy and capacity exhausted: these land in the queue.
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.submit_timeout(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(100),
            )
            .unwrap();
        }
        // Queue is now full; the next one cannot be admitted.
        let err = pool
            .submit_timeout(|| {}, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SubmitError::DeadlineExceeded));

        release_tx.send(()).unwrap();
        assert!(wait_for(
            || counter.load(Ordering::SeqCst) == 3,
            Duration::from_secs(5),
        ));
        pool.close();
    }

    #[test]
    fn test_spawns_up_to_capacity_on_demand() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 3,
            queue_size: 0,
            initial_workers: 1,
        });
        assert_eq!(pool.live_workers(), 1);

        let (release_tx, release_rx) = bounded::<()>(0);
        let barrier = Arc::new(std::sync::Barrier::new(4));
        for _ in 0..3 {
            let release_rx = release_rx.clone();
            let barrier = Arc::clone(&barrier);
            pool.submit(move || {
                barrier.wait();
                let _ = release_rx.recv();
            });
        }
        barrier.wait();
        assert_eq!(pool.live_workers(), 3);

        drop(release_tx);
        pool.close();
        assert!(wait_for(|| pool.live_workers() == 0, Duration::from_secs(5)));
    }

    #[test]
    fn test_shrink_exits_idle_workers_only() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 4,
            queue_size: 4,
            initial_workers: 3,
        });
        assert!(wait_for(|| pool.live_workers() == 3, Duration::from_secs(1)));

        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(0);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        // One worker mid-job; the two idle ones must exit, the busy one not.
        pool.shrink();
        assert!(wait_for(|| pool.live_workers() == 1, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.live_workers(), 1);

        // Finishing the job lands the survivor on the fresh gate: it stays.
        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.live_workers(), 1);

        pool.shrink();
        assert!(wait_for(|| pool.live_workers() == 0, Duration::from_secs(5)));
        pool.close();
    }

    #[test]
    fn test_capacity_is_reusable_after_shrink() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 2,
            queue_size: 0,
            initial_workers: 2,
        });
        pool.shrink();
        assert!(wait_for(|| pool.live_workers() == 0, Duration::from_secs(5)));

        // Released slots can back fresh on-demand workers.
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_for(
            || counter.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5),
        ));
        pool.close();
    }

    #[test]
    fn test_close_drains_queued_jobs() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 2,
            queue_size: 16,
            initial_workers: 2,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.close();
        assert!(wait_for(
            || counter.load(Ordering::SeqCst) == 10,
            Duration::from_secs(5),
        ));
        assert!(wait_for(|| pool.live_workers() == 0, Duration::from_secs(5)));
    }

    #[test]
    fn test_submit_timeout_after_close_reports_closed() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 1,
            queue_size: 0,
            initial_workers: 0,
        });
        pool.close();
        let err = pool
            .submit_timeout(|| {}, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SubmitError::Closed));
    }

    #[test]
    #[should_panic(expected = "worker pool cannot accept work")]
    fn test_submit_after_close_panics() {
        let pool = ElasticPool::new(PoolConfig {
            capacity: 1,
            queue_size: 0,
            initial_workers: 0,
        });
        pool.close();
        pool.submit(|| {});
    }

    #[test]
    #[should_panic(expected = "pool capacity must be positive")]
    fn test_rejects_zero_capacity() {
        ElasticPool::new(PoolConfig {
            capacity: 0,
            queue_size: 0,
            initial_workers: 0,
        });
    }

    #[test]
    #[should_panic(expected = "initial_workers must not exceed capacity")]
    fn test_rejects_initial_workers_above_capacity() {
        ElasticPool::new(PoolConfig {
            capacity: 2,
            queue_size: 0,
            initial_workers: 3,
        });
    }

    #[test]
    #[should_panic(expected = "a non-empty queue needs at least one standing worker")]
    fn test_rejects_queue_without_standing_workers() {
        ElasticPool::new(PoolConfig {
            capacity: 2,
            queue_size: 4,
            initial_workers: 0,
        });
    }
}
