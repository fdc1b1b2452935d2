//! Suspending a task until a file descriptor is ready.
//!
//! [`trampoline`] is the primitive that protocol wrappers build on: it
//! registers interest in one direction of an fd, optionally arms a timeout,
//! and suspends the calling task. Whichever comes first wins:
//!
//! - the fd becomes ready: resolves to `Ok(fd)`,
//! - the timeout fires: resolves to `Err(Error::Timeout(..))` (or the
//!   error set with [`Trampoline::timeout_error`]),
//! - the fd is closed under the task: resolves to `Err(Error::Closed(fd))`.
//!
//! The registration and the timer are removed on completion and when the
//! future is dropped.
//!
//! # Example
//!
//! ```ignore
//! use greenhub::{trampoline, Direction};
//! use std::time::Duration;
//!
//! async fn wait_readable(fd: RawFd) -> greenhub::Result<()> {
//!     trampoline(fd, Direction::Read, Some(Duration::from_secs(1))).await?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::hub::{Direction, Hub, ListenerId, TimerHandle, get_hub};
use crate::task::ensure_task;

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

#[derive(Default)]
struct Shared {
    outcome: RefCell<Option<Result<RawFd>>>,
    waker: RefCell<Option<Waker>>,
}

impl Shared {
    /// Records the first outcome and wakes the task. Later ones are ignored.
    fn resolve(&self, outcome: Result<RawFd>) {
        {
            let mut slot = self.outcome.borrow_mut();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }

        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

struct Armed {
    hub: Hub,
    listener: ListenerId,
    timer: Option<TimerHandle>,
    shared: Rc<Shared>,
}

impl Armed {
    fn disarm(&self) {
        self.hub.remove(self.listener);
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}

/// Suspends the calling task until `fd` is ready in `direction`.
///
/// # Arguments
/// * `fd` - The file descriptor to watch
/// * `direction` - Read or write readiness
/// * `timeout` - Give up after this long, `None` to wait forever
///
/// # Errors
/// - [`Error::BlockingInHub`] when awaited outside of a task,
/// - [`Error::DuplicateListener`] when another task already waits on the
///   same fd and direction,
/// - [`Error::Timeout`] when `timeout` elapses first,
/// - [`Error::Closed`] when the fd is closed while waiting.
pub fn trampoline(fd: RawFd, direction: Direction, timeout: Option<Duration>) -> Trampoline {
    Trampoline {
        fd,
        direction,
        timeout,
        timeout_error: None,
        armed: None,
    }
}

/// Future returned by [`trampoline`].
pub struct Trampoline {
    fd: RawFd,
    direction: Direction,
    timeout: Option<Duration>,
    timeout_error: Option<Error>,
    armed: Option<Armed>,
}

impl Trampoline {
    /// Error to resolve with when the timeout fires, instead of
    /// [`Error::Timeout`].
    pub fn timeout_error(mut self, error: Error) -> Self {
        self.timeout_error = Some(error);
        self
    }

    fn arm(&mut self, waker: &Waker) -> Result<()> {
        ensure_task()?;

        let hub = get_hub();
        let shared = Rc::new(Shared::default());
        *shared.waker.borrow_mut() = Some(waker.clone());

        let on_ready = shared.clone();
        let on_close = shared.clone();
        let listener = hub.add(
            self.direction,
            self.fd,
            move |fd| on_ready.resolve(Ok(fd)),
            move |fd| on_close.resolve(Err(Error::Closed(fd))),
        )?;

        let timer = self.timeout.map(|timeout| {
            let on_timeout = shared.clone();
            let error = self
                .timeout_error
                .take()
                .unwrap_or(Error::Timeout(timeout));
            hub.schedule_call_global(timeout, move || on_timeout.resolve(Err(error)))
        });

        self.armed = Some(Armed {
            hub,
            listener,
            timer,
            shared,
        });
        Ok(())
    }
}

impl Future for Trampoline {
    type Output = Result<RawFd>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.armed.is_none() {
            if let Err(err) = this.arm(cx.waker()) {
                return Poll::Ready(Err(err));
            }
            return Poll::Pending;
        }

        let Some(armed) = &this.armed else {
            return Poll::Pending;
        };

        let outcome = armed.shared.outcome.borrow_mut().take();
        match outcome {
            Some(outcome) => {
                armed.disarm();
                this.armed = None;
                Poll::Ready(outcome)
            }
            None => {
                *armed.shared.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.disarm();
        }
    }
}
