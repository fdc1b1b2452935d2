//! Event loop subsystem: timers, fd listeners and readiness backends.

mod core;
mod listener;
pub(crate) mod poller;
mod timer;

pub use self::core::{Hub, HubStats};
pub(crate) use self::core::{Exit, WeakHub};
pub use listener::{Direction, ListenerId};
pub use timer::TimerHandle;

pub use crate::runtime::context::{get_hub, try_get_hub, use_hub};

use std::time::Duration;

/// Schedules `callback` on the current thread's hub, see
/// [`Hub::schedule_call_global`].
pub fn schedule_call_global<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + 'static,
{
    get_hub().schedule_call_global(delay, callback)
}

/// Schedules `callback` on the current thread's hub, tied to the calling
/// task, see [`Hub::schedule_call_local`].
pub fn schedule_call_local<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + 'static,
{
    get_hub().schedule_call_local(delay, callback)
}
