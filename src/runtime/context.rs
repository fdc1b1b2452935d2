//! Thread-local hub and task context.
//!
//! Every thread owns at most one hub, created lazily on first use from the
//! `GREENHUB_*` environment variables. While a task is being polled its id is
//! recorded here as well, which is how primitives find out "who is calling"
//! without threading a handle through every API.
//!
//! # Example
//!
//! ```ignore
//! use greenhub::{get_hub, current_task};
//!
//! let hub = get_hub();
//! assert!(current_task().is_none());
//! ```

use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::task::TaskId;

use std::cell::{Cell, RefCell};
use tracing::warn;

thread_local! {
    /// The hub used by free functions such as `spawn` and `sleep`.
    ///
    /// Created by [`get_hub`] and swapped by [`enter_hub`] for the duration
    /// of a `block_on`.
    static CURRENT_HUB: RefCell<Option<Hub>> = const { RefCell::new(None) };

    /// Id of the task being polled, if any.
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Returns this thread's hub, creating it on first use.
///
/// The backend and the idle interval come from the environment (see
/// [`HubConfig::from_env`]); an invalid value is logged and the defaults are
/// used instead.
///
/// # Panics
/// Panics if even a default hub cannot be created (the OS refused a pipe or
/// a poller object). Use [`try_get_hub`] to handle that case.
pub fn get_hub() -> Hub {
    try_get_hub().unwrap_or_else(|err| panic!("cannot create the hub for this thread: {err}"))
}

/// Fallible version of [`get_hub`].
pub fn try_get_hub() -> Result<Hub> {
    let existing = CURRENT_HUB.with(|current| current.borrow().clone());
    if let Some(hub) = existing {
        return Ok(hub);
    }

    let config = HubConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "ignoring invalid hub configuration from the environment");
        HubConfig::default()
    });

    let hub = match Hub::new(config) {
        Ok(hub) => hub,
        Err(err) => {
            warn!(error = %err, "configured hub backend failed, falling back to defaults");
            Hub::new(HubConfig::default())?
        }
    };

    CURRENT_HUB.with(|current| *current.borrow_mut() = Some(hub.clone()));
    Ok(hub)
}

/// Replaces this thread's hub with a new one built from `config`.
///
/// # Errors
/// [`Error::AlreadyRunning`] if the current hub is running its loop, or any
/// error from [`Hub::new`].
pub fn use_hub(config: HubConfig) -> Result<Hub> {
    let running = CURRENT_HUB.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|hub| hub.is_running())
    });
    if running {
        return Err(Error::AlreadyRunning);
    }

    let hub = Hub::new(config)?;
    CURRENT_HUB.with(|current| *current.borrow_mut() = Some(hub.clone()));
    Ok(hub)
}

/// Runs `function` with `hub` installed as the thread's hub, restoring the
/// previous one afterwards.
pub(crate) fn enter_hub<F, R>(hub: Hub, function: F) -> R
where
    F: FnOnce() -> R,
{
    struct Restore(Option<Hub>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT_HUB.with(|current| *current.borrow_mut() = previous);
        }
    }

    let previous = CURRENT_HUB.with(|current| current.borrow_mut().replace(hub));
    let _restore = Restore(previous);
    function()
}

/// Id of the task currently being polled, or `None` in hub context.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

/// Runs `function` with `id` recorded as the current task.
pub(crate) fn enter_task<F, R>(id: TaskId, function: F) -> R
where
    F: FnOnce() -> R,
{
    struct Restore(Option<TaskId>);

    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT_TASK.with(|current| current.set(self.0));
        }
    }

    let _restore = Restore(CURRENT_TASK.with(|current| current.replace(Some(id))));
    function()
}
