//! Synchronization primitives for tasks running on one hub.
//!
//! None of these types are `Send`: they are shared between tasks of the same
//! thread through `Rc`. Waking a waiter never runs it inline; it resumes on a
//! later turn of the hub.

pub mod dagpool;
pub mod event;
pub mod pool;
pub mod queue;
pub mod semaphore;

pub use dagpool::{DagError, DagPool, PropagateError, WaitEach};
pub use event::{Event, EventWait};
pub use pool::{Pile, Pool};
pub use queue::{Get, Put, Queue};
pub use semaphore::{Acquire, Semaphore, SemaphoreGuard};
