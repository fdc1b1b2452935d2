//! Counting semaphore.
//!
//! The counter may go negative after a [`Semaphore::resize`] that shrinks the
//! capacity below the number of current holders; new acquirers then wait
//! until enough releases have paid the difference back.
//!
//! Waiters are served first come, first served. A release does not hand the
//! slot over inline: the grant runs as a zero-delay timer, so the releasing
//! task keeps running.

use crate::error::{Error, Result};
use crate::hub::get_hub;
use crate::time::timeout;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

struct Waiter {
    granted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

struct SemaphoreInner {
    counter: Cell<isize>,
    capacity: Cell<isize>,
    bounded: bool,
    waiters: RefCell<VecDeque<Rc<Waiter>>>,
    handoff_scheduled: Cell<bool>,
    this: Weak<SemaphoreInner>,
}

impl SemaphoreInner {
    fn release(&self) -> Result<()> {
        if self.bounded && self.counter.get() >= self.capacity.get() {
            return Err(Error::ReleasedTooManyTimes);
        }

        self.counter.set(self.counter.get() + 1);
        self.schedule_handoff();
        Ok(())
    }

    fn schedule_handoff(&self) {
        if self.waiters.borrow().is_empty() || self.handoff_scheduled.replace(true) {
            return;
        }

        let semaphore = self.this.clone();
        get_hub().schedule_call_global(Duration::ZERO, move || {
            if let Some(semaphore) = semaphore.upgrade() {
                semaphore.handoff_scheduled.set(false);
                semaphore.handoff();
            }
        });
    }

    /// Grants free units to waiters, oldest first.
    fn handoff(&self) {
        while self.counter.get() > 0 {
            let waiter = self.waiters.borrow_mut().pop_front();
            let Some(waiter) = waiter else {
                break;
            };

            self.counter.set(self.counter.get() - 1);
            waiter.granted.set(true);
            if let Some(waker) = waiter.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }
}

/// A counting semaphore shared between tasks.
///
/// # Example
/// ```ignore
/// let semaphore = Semaphore::new(2);
/// semaphore.acquire().await;
/// // ... at most two tasks here ...
/// semaphore.release()?;
/// ```
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<SemaphoreInner>,
}

impl Semaphore {
    fn build(value: usize, bounded: bool) -> Self {
        let value = isize::try_from(value).unwrap_or(isize::MAX);
        Self {
            inner: Rc::new_cyclic(|this| SemaphoreInner {
                counter: Cell::new(value),
                capacity: Cell::new(value),
                bounded,
                waiters: RefCell::new(VecDeque::new()),
                handoff_scheduled: Cell::new(false),
                this: this.clone(),
            }),
        }
    }

    /// Semaphore with `value` free units. Releases beyond that are allowed.
    pub fn new(value: usize) -> Self {
        Self::build(value, false)
    }

    /// Semaphore whose counter can never exceed its capacity.
    pub fn bounded(value: usize) -> Self {
        Self::build(value, true)
    }

    /// Takes one unit, waiting if none is free.
    ///
    /// Returns at once, without suspending, when a unit is free and nobody is
    /// queued before the caller.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            semaphore: self.inner.clone(),
            waiter: None,
        }
    }

    /// Takes one unit only if that can happen without waiting.
    pub fn try_acquire(&self) -> bool {
        let inner = &self.inner;
        if inner.counter.get() > 0 && inner.waiters.borrow().is_empty() {
            inner.counter.set(inner.counter.get() - 1);
            return true;
        }
        false
    }

    /// Like [`Semaphore::acquire`], giving up after `duration`.
    ///
    /// # Errors
    /// [`Error::Timeout`] if no unit became free in time.
    pub async fn acquire_timeout(&self, duration: Duration) -> Result<()> {
        timeout(duration, self.acquire()).await
    }

    /// Returns one unit and wakes the oldest waiter, if any.
    ///
    /// # Errors
    /// [`Error::ReleasedTooManyTimes`] on a bounded semaphore that is
    /// already at capacity.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    /// Acquires a unit and returns a guard that releases it when dropped.
    pub async fn access(&self) -> SemaphoreGuard {
        self.acquire().await;
        SemaphoreGuard {
            semaphore: self.clone(),
        }
    }

    /// True if an `acquire` would have to wait.
    pub fn locked(&self) -> bool {
        self.inner.counter.get() <= 0
    }

    /// Free units minus waiting tasks. Negative when tasks are queued.
    pub fn balance(&self) -> isize {
        self.inner.counter.get() - self.inner.waiters.borrow().len() as isize
    }

    /// Current counter; negative while holders exceed a shrunk capacity.
    pub fn available(&self) -> isize {
        self.inner.counter.get()
    }

    pub fn capacity(&self) -> isize {
        self.inner.capacity.get()
    }

    /// Tasks blocked in `acquire`.
    pub fn waiting(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    /// Changes the capacity; the counter moves by the same amount, so
    /// current holders are unaffected.
    pub fn resize(&self, capacity: usize) {
        let capacity = isize::try_from(capacity).unwrap_or(isize::MAX);
        let delta = capacity - self.inner.capacity.get();

        self.inner.capacity.set(capacity);
        self.inner.counter.set(self.inner.counter.get() + delta);
        if delta > 0 {
            self.inner.schedule_handoff();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("counter", &self.inner.counter.get())
            .field("capacity", &self.inner.capacity.get())
            .field("waiters", &self.inner.waiters.borrow().len())
            .finish()
    }
}

/// Future returned by [`Semaphore::acquire`].
pub struct Acquire {
    semaphore: Rc<SemaphoreInner>,
    waiter: Option<Rc<Waiter>>,
}

impl Future for Acquire {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;

        if let Some(waiter) = &this.waiter {
            if waiter.granted.get() {
                this.waiter = None;
                return Poll::Ready(());
            }
            *waiter.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let semaphore = &this.semaphore;
        if semaphore.counter.get() > 0 && semaphore.waiters.borrow().is_empty() {
            semaphore.counter.set(semaphore.counter.get() - 1);
            return Poll::Ready(());
        }

        let waiter = Rc::new(Waiter {
            granted: Cell::new(false),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        semaphore.waiters.borrow_mut().push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        if waiter.granted.get() {
            // Granted but never observed: give the unit back.
            let _ = self.semaphore.release();
        } else {
            self.semaphore
                .waiters
                .borrow_mut()
                .retain(|other| !Rc::ptr_eq(other, &waiter));
        }
    }
}

/// Releases its unit when dropped, see [`Semaphore::access`].
pub struct SemaphoreGuard {
    semaphore: Semaphore,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let _ = self.semaphore.release();
    }
}
