//! Execution machinery underneath the bridge.
//!
//! - [`event_loop`]: the single-threaded cooperative loop that async code
//!   runs on, with [`JoinHandle`], [`sleep`] and [`yield_now`]
//! - [`cancel`]: cancellation tokens and drain guards
//! - [`blocking_pool`]: worker pools for sync callables
//! - [`idle_executor`]: runs nested sync work on a thread blocked in an
//!   async call
//! - [`executor`]: the [`Executor`] seam shared by pools and idle executors
//! - [`slot`]: single-assignment result slots
//! - [`waker`], [`timer`]: loop wake bookkeeping and deadlines
//!
//! # Example
//!
//! ```
//! use syncbridge::runtime::{current_loop, sleep, EventLoop};
//! use std::time::Duration;
//!
//! let sum = EventLoop::block_on(async {
//!     let handle = current_loop().unwrap();
//!     let task = handle.spawn(async {
//!         sleep(Duration::from_millis(1)).await;
//!         2
//!     }).unwrap();
//!     40 + task.await.unwrap()
//! })
//! .unwrap();
//! assert_eq!(sum, 42);
//! ```

pub mod blocking_pool;
pub mod cancel;
pub mod event_loop;
pub mod executor;
pub mod idle_executor;
pub mod slot;
pub mod timer;
pub mod waker;

pub use blocking_pool::{BlockingPool, BlockingPoolHandle, BlockingPoolOptions};
pub use cancel::{CancelToken, DrainGuard};
pub use event_loop::{
    current_loop, current_task, is_loop_thread, sleep, yield_now, EventLoop, JoinHandle,
    LoopHandle, Sleep, YieldNow,
};
pub use executor::{Executor, Job, Submission};
pub use idle_executor::IdleExecutor;
pub use slot::{ResultSlot, SlotProbe};
