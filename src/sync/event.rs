//! One-shot future.
//!
//! An [`Event`] is sent exactly once (until [`Event::reset`]) and any number
//! of tasks can wait for it. Sending never suspends the sender: each waiter
//! gets its own copy of the outcome and is woken through the hub, so it
//! resumes on a later loop turn. Waiters are woken roughly in the order they
//! started waiting; that order is not a guarantee.

use crate::error::{Error, Result};
use crate::time::timeout;

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

struct WaitSlot<T, E> {
    outcome: RefCell<Option<Result<T, E>>>,
    waker: RefCell<Option<Waker>>,
}

struct EventInner<T, E> {
    outcome: RefCell<Option<Result<T, E>>>,
    waiters: RefCell<Vec<Rc<WaitSlot<T, E>>>>,
}

/// A value (or error) delivered once to every waiter.
///
/// # Example
/// ```ignore
/// let event = Event::<u32>::new();
/// let waiter = event.clone();
/// spawn(async move { waiter.wait().await });
/// event.send(3)?;
/// ```
pub struct Event<T, E = Error> {
    inner: Rc<EventInner<T, E>>,
}

impl<T, E> Clone for Event<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone, E: Clone> Default for Event<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> Event<T, E> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EventInner {
                outcome: RefCell::new(None),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    /// True once `send` or `send_exception` has been called.
    pub fn ready(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn has_value(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(Ok(_)))
    }

    pub fn has_exception(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(Err(_)))
    }

    /// The outcome, if the event was sent, without waiting.
    pub fn try_get(&self) -> Option<Result<T, E>> {
        self.inner.outcome.borrow().clone()
    }

    /// Delivers `value` to every current and future waiter.
    ///
    /// # Errors
    /// [`Error::AlreadySent`] if the event was sent and not reset since.
    pub fn send(&self, value: T) -> Result<()> {
        self.deliver(Ok(value))
    }

    /// Delivers `error` to every current and future waiter.
    pub fn send_exception(&self, error: E) -> Result<()> {
        self.deliver(Err(error))
    }

    fn deliver(&self, outcome: Result<T, E>) -> Result<()> {
        if self.ready() {
            return Err(Error::AlreadySent);
        }

        let waiters = std::mem::take(&mut *self.inner.waiters.borrow_mut());
        for slot in waiters {
            *slot.outcome.borrow_mut() = Some(outcome.clone());
            if let Some(waker) = slot.waker.borrow_mut().take() {
                waker.wake();
            }
        }

        *self.inner.outcome.borrow_mut() = Some(outcome);
        Ok(())
    }

    /// Clears a sent event so it can be sent again.
    ///
    /// Waiters that were already woken still receive the old outcome.
    ///
    /// # Errors
    /// [`Error::NotSent`] if the event holds no outcome.
    pub fn reset(&self) -> Result<()> {
        if self.inner.outcome.borrow_mut().take().is_none() {
            return Err(Error::NotSent);
        }
        Ok(())
    }

    /// Waits for the outcome. Returns at once if the event was already sent.
    pub fn wait(&self) -> EventWait<T, E> {
        EventWait {
            event: self.inner.clone(),
            slot: None,
        }
    }

    /// Like [`Event::wait`], but gives up after `duration` and returns `None`.
    pub async fn wait_timeout(&self, duration: Duration) -> Option<Result<T, E>> {
        timeout(duration, self.wait()).await.ok()
    }
}

impl<T, E> fmt::Debug for Event<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.outcome.borrow() {
            None => "pending",
            Some(Ok(_)) => "value",
            Some(Err(_)) => "exception",
        };
        f.debug_struct("Event")
            .field("state", &state)
            .field("waiters", &self.inner.waiters.borrow().len())
            .finish()
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait<T, E = Error> {
    event: Rc<EventInner<T, E>>,
    slot: Option<Rc<WaitSlot<T, E>>>,
}

impl<T: Clone, E: Clone> Future for EventWait<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(slot) = this.slot.clone() {
            let outcome = slot.outcome.borrow_mut().take();
            if let Some(outcome) = outcome {
                this.slot = None;
                return Poll::Ready(outcome);
            }
            *slot.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let outcome = this.event.outcome.borrow().clone();
        if let Some(outcome) = outcome {
            return Poll::Ready(outcome);
        }

        let slot = Rc::new(WaitSlot {
            outcome: RefCell::new(None),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        this.event.waiters.borrow_mut().push(slot.clone());
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl<T, E> Drop for EventWait<T, E> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.event
                .waiters
                .borrow_mut()
                .retain(|other| !Rc::ptr_eq(other, &slot));
        }
    }
}
