//! Delayed one-shot job scheduling without a timer or thread per pending item.
//!
//! Two primitives make up the crate: a [`TimingWheel`] that buckets pending
//! work by due-tick into fixed slots and drains due jobs once per interval,
//! and an [`ElasticPool`] that bounds how many jobs run concurrently while
//! spawning workers on demand and shrinking idle capacity on request. The
//! wheel's slots are backed by [`BucketList`], a multi-producer
//! single-consumer doubly-linked list whose concurrency contract the wheel's
//! driver relies on.
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::{ElasticPool, PoolConfig, TimingWheel, WheelConfig};
//!
//! let pool = ElasticPool::new(PoolConfig::default());
//! let wheel = TimingWheel::new(
//!     WheelConfig {
//!         interval: Duration::from_millis(100),
//!         slot_count: 600,
//!     },
//!     pool,
//! );
//! wheel.start();
//! wheel.add_task(Duration::from_secs(30), || {
//!     println!("30s idle timeout fired");
//! });
//! // ...
//! wheel.stop();
//! ```
//!
//! Jobs are fire-and-forget: the wheel offers no per-task cancellation and
//! [`TimingWheel::stop`] discards everything still waiting. Job closures own
//! their own failure handling; the pool performs no isolation or restart of a
//! worker whose job panics.

pub mod list;
pub mod pool;
pub mod wheel;

pub use list::{BucketList, NodeHandle, ShardedList, Visit};
pub use pool::{ElasticPool, Job, PoolConfig, SubmitError};
pub use wheel::{TimingWheel, WheelConfig};
