//! Cooperative, single-threaded task runtime built around a hub.
//!
//! Every thread gets one hub: an event loop multiplexing timers and file
//! descriptor readiness. Tasks are `'static` futures that run on the hub and
//! suspend only at explicit points (`sleep`, `trampoline`, waiting on a
//! primitive or on another task). Everything a task wakes up for is turned
//! into a zero-delay timer, so the hub is the only thing that ever blocks.
//!
//! # Architecture
//!
//! - **Hub**: timer heap, fd listeners and a `select`/`poll`/`epoll`/`kqueue`
//!   backend
//! - **Runtime**: drives the hub until a main future completes via `block_on`
//! - **RuntimeBuilder**: fluent builder picking the hub's configuration
//! - **Task**: `spawn`, `spawn_n`, `spawn_after`, kill and join handles
//! - **Trampoline**: suspends a task until an fd is ready or a timeout fires
//! - **Time**: `sleep`, `yield_now` and `timeout`
//! - **Sync**: `Event`, `Queue`, `Semaphore`, `Pool` and `DagPool`
//!
//! # Example
//!
//! ```ignore
//! use greenhub::{Runtime, spawn, sleep};
//! use std::time::Duration;
//!
//! let mut rt = Runtime::new();
//! let answer = rt.block_on(async {
//!     let handle = spawn(async {
//!         sleep(Duration::from_millis(5)).await;
//!         42
//!     });
//!     handle.await
//! });
//! assert_eq!(answer, Ok(42));
//! ```

mod builder;
pub mod config;
mod error;
pub mod hub;
mod runtime;
pub mod sync;
mod task;
pub mod time;
mod trampoline;

pub use builder::RuntimeBuilder;
pub use config::{Backend, HubConfig};
pub use error::{ConfigError, Error, Result, TaskError};
pub use hub::{
    Direction, Hub, HubStats, ListenerId, TimerHandle, get_hub, schedule_call_global,
    schedule_call_local, try_get_hub, use_hub,
};
pub use runtime::Runtime;
pub use runtime::yield_now::yield_now;
pub use sync::{DagError, DagPool, Event, Pile, Pool, PropagateError, Queue, Semaphore};
pub use task::{
    JoinHandle, TaskId, current_task, spawn, spawn_after, spawn_after_local, spawn_n,
};
pub use time::{sleep, timeout};
pub use trampoline::{Trampoline, trampoline};
