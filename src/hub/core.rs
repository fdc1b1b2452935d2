//! The hub: a single-threaded loop over timers and fd readiness.
//!
//! Each turn of the loop:
//!
//! 1. delivers "closed" notifications queued by [`Hub::notify_close`],
//! 2. turns woken tasks into zero-delay timers,
//! 3. fires every timer that is due, in deadline order,
//! 4. blocks in the backend until the next deadline (or the idle interval),
//! 5. dispatches read/write callbacks for the fds that became ready.
//!
//! Every callback runs in isolation: a panic is caught, counted and logged,
//! and the loop carries on.

use crate::config::{Backend, HubConfig};
use crate::error::{Error, Result, TaskError};
use crate::hub::listener::{Direction, FdCallback, Listener, ListenerId, Listeners};
use crate::hub::poller::{Interest, Poller, Readiness, new_poller};
use crate::hub::timer::{TimerHandle, TimerHeap};
use crate::runtime::context::current_task;
use crate::runtime::waker::ReadyQueue;
use crate::task::{Runnable, TaskId};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Why [`Hub::run_until`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The `done` predicate became true.
    Finished,
    /// [`Hub::abort`] was called.
    Aborted,
    /// Nothing is left that could ever make progress.
    Stalled,
}

/// Snapshot of the hub's counters, see [`Hub::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live timers waiting to fire.
    pub timers: usize,
    /// Timer callbacks run since the hub was created.
    pub timers_fired: u64,
    /// Timers canceled since the hub was created.
    pub timers_canceled: u64,
    /// Callbacks that panicked inside the loop.
    pub callback_errors: u64,
    /// Active read listeners.
    pub readers: usize,
    /// Active write listeners.
    pub writers: usize,
    /// Stacked listeners waiting for promotion.
    pub secondaries: usize,
    /// Tasks that have started and not finished.
    pub tasks: usize,
}

pub(crate) struct HubInner {
    config: HubConfig,
    timers: RefCell<TimerHeap>,
    listeners: RefCell<Listeners>,
    closed: RefCell<Vec<Listener>>,
    poller: RefCell<Box<dyn Poller>>,
    ready: Arc<ReadyQueue>,
    tasks: RefCell<HashMap<TaskId, Rc<dyn Runnable>>>,
    running: Cell<bool>,
    stopping: Cell<bool>,
    timers_fired: Cell<u64>,
    callback_errors: Cell<u64>,
    events: RefCell<Vec<Readiness>>,
}

/// Handle to a thread's event loop.
///
/// Cloning is cheap; all clones drive the same loop. A hub never leaves the
/// thread that created it.
#[derive(Clone)]
pub struct Hub {
    inner: Rc<HubInner>,
}

/// Non-owning reference to a hub, held by callbacks the hub itself stores.
#[derive(Clone, Default)]
pub(crate) struct WeakHub(Weak<HubInner>);

impl WeakHub {
    pub(crate) fn upgrade(&self) -> Option<Hub> {
        self.0.upgrade().map(|inner| Hub { inner })
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Hub {
    /// Creates a hub with the given configuration.
    ///
    /// Most code should use [`crate::get_hub`] instead, which lazily creates
    /// one hub per thread.
    ///
    /// # Errors
    /// Fails if the backend is not available on this platform or if the
    /// backend's kernel object or wake pipe cannot be created.
    pub fn new(config: HubConfig) -> Result<Self> {
        config.validate()?;

        let poller = new_poller(config.backend)?;
        let ready = Arc::new(ReadyQueue::new()?);

        debug!(backend = %config.backend, "hub created");

        Ok(Self {
            inner: Rc::new(HubInner {
                config,
                timers: RefCell::new(TimerHeap::new()),
                listeners: RefCell::new(Listeners::new()),
                closed: RefCell::new(Vec::new()),
                poller: RefCell::new(poller),
                ready,
                tasks: RefCell::new(HashMap::new()),
                running: Cell::new(false),
                stopping: Cell::new(false),
                timers_fired: Cell::new(0),
                callback_errors: Cell::new(0),
                events: RefCell::new(Vec::with_capacity(64)),
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> Backend {
        self.inner.config.backend
    }

    /// True while [`Hub::run`] (or a `block_on`) is driving this hub.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// True if both handles refer to the same hub.
    pub fn ptr_eq(&self, other: &Hub) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakHub {
        WeakHub(Rc::downgrade(&self.inner))
    }

    /// Schedules `callback` to run after `delay`.
    ///
    /// The callback runs even if the task that scheduled it has exited.
    ///
    /// # Example
    /// ```ignore
    /// let timer = get_hub().schedule_call_global(Duration::from_millis(10), || {
    ///     println!("fired");
    /// });
    /// timer.cancel();
    /// ```
    pub fn schedule_call_global<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.schedule_at(Instant::now() + delay, None, Box::new(callback))
    }

    /// Schedules `callback` to run after `delay`, but only if the calling
    /// task is still alive by then.
    ///
    /// Called outside of a task this behaves like
    /// [`Hub::schedule_call_global`].
    pub fn schedule_call_local<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.schedule_at(Instant::now() + delay, current_task(), Box::new(callback))
    }

    pub(crate) fn schedule_at(
        &self,
        deadline: Instant,
        owner: Option<TaskId>,
        callback: Box<dyn FnOnce()>,
    ) -> TimerHandle {
        self.inner
            .timers
            .borrow_mut()
            .schedule(deadline, owner, callback)
    }

    /// Registers interest in `fd`.
    ///
    /// `cb` is called with the fd every time it is ready in `direction`.
    /// `tb` is called once if the fd turns out to be closed, after which the
    /// listener is gone.
    ///
    /// # Errors
    /// [`Error::DuplicateListener`] if a listener for the same fd and
    /// direction exists and the hub prevents multiple readers.
    pub fn add<C, T>(&self, direction: Direction, fd: RawFd, cb: C, tb: T) -> Result<ListenerId>
    where
        C: Fn(RawFd) + 'static,
        T: Fn(RawFd) + 'static,
    {
        let cb: FdCallback = Rc::new(cb);
        let tb: FdCallback = Rc::new(tb);
        let allow_secondary = !self.inner.config.prevent_multiple_readers;

        let id = self
            .inner
            .listeners
            .borrow_mut()
            .add(direction, fd, cb, tb, allow_secondary)?;

        trace!(fd, %direction, "listener added");
        Ok(id)
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.inner.listeners.borrow_mut().remove(id).is_some()
    }

    /// Drops every listener on `fd` without notifying them.
    ///
    /// Returns how many listeners were removed.
    pub fn remove_descriptor(&self, fd: RawFd) -> usize {
        let removed = self.inner.listeners.borrow_mut().remove_descriptor(fd);
        if !removed.is_empty() {
            debug!(fd, listeners = removed.len(), "descriptor removed");
        }
        removed.len()
    }

    /// Tells every listener on `fd` that it was closed.
    ///
    /// The listeners are removed now and their close callbacks run at the
    /// start of the next loop turn, never from inside the caller.
    pub fn notify_close(&self, fd: RawFd) {
        let removed = self.inner.listeners.borrow_mut().remove_descriptor(fd);
        if removed.is_empty() {
            return;
        }

        debug!(fd, listeners = removed.len(), "descriptor closed");
        self.inner.closed.borrow_mut().extend(removed);
    }

    /// Runs the loop until [`Hub::abort`] is called.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] if the loop is already being driven, or an
    /// I/O error from the backend.
    pub fn run(&self) -> Result<()> {
        self.run_until(&|| false, false).map(|_| ())
    }

    /// Asks the loop to return after the current turn.
    pub fn abort(&self) {
        debug!("hub abort requested");
        self.inner.stopping.set(true);
    }

    pub fn stats(&self) -> HubStats {
        let timers = self.inner.timers.borrow();
        let listeners = self.inner.listeners.borrow();

        HubStats {
            timers: timers.len(),
            timers_fired: self.inner.timers_fired.get(),
            timers_canceled: timers.total_canceled(),
            callback_errors: self.inner.callback_errors.get(),
            readers: listeners.readers(),
            writers: listeners.writers(),
            secondaries: listeners.secondaries(),
            tasks: self.inner.tasks.borrow().len(),
        }
    }

    pub(crate) fn ready_queue(&self) -> Arc<ReadyQueue> {
        self.inner.ready.clone()
    }

    pub(crate) fn register_task(&self, task: Rc<dyn Runnable>) {
        self.inner.tasks.borrow_mut().insert(task.id(), task);
    }

    pub(crate) fn unregister_task(&self, id: TaskId) {
        self.inner.tasks.borrow_mut().remove(&id);
    }

    /// Schedules a zero-delay run of a started task, unless one is pending.
    pub(crate) fn schedule_task(&self, id: TaskId) {
        let task = self.inner.tasks.borrow().get(&id).cloned();
        let Some(task) = task else {
            return;
        };

        if task.is_scheduled() {
            return;
        }
        task.set_scheduled(true);

        let hub = self.downgrade();
        self.schedule_at(
            Instant::now(),
            None,
            Box::new(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.run_task(id);
                }
            }),
        );
    }

    fn run_task(&self, id: TaskId) {
        let task = self.inner.tasks.borrow().get(&id).cloned();
        if let Some(task) = task {
            task.set_scheduled(false);
            task.run(self);
        }
    }

    /// Drives the loop until `done` returns true or the hub is aborted.
    ///
    /// With `stall_exit`, the loop also returns once there is nothing left
    /// that could wake anybody: no timers, no listeners, no woken tasks.
    pub(crate) fn run_until(&self, done: &dyn Fn() -> bool, stall_exit: bool) -> Result<Exit> {
        if self.inner.running.replace(true) {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.inner.running);
        self.inner.stopping.set(false);

        debug!(backend = %self.backend(), "hub loop started");

        loop {
            if let Some(exit) = self.should_exit(done) {
                debug!(?exit, "hub loop finished");
                return Ok(exit);
            }

            self.deliver_closed();
            self.prepare_timers();
            self.fire_timers(Instant::now());
            self.prepare_timers();

            if let Some(exit) = self.should_exit(done) {
                debug!(?exit, "hub loop finished");
                return Ok(exit);
            }

            let deadline = self.inner.timers.borrow_mut().next_deadline();
            let timeout = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None if stall_exit && self.is_idle() => {
                    debug!("hub loop stalled");
                    return Ok(Exit::Stalled);
                }
                None => self.inner.config.default_sleep,
            };

            self.wait(timeout)?;
        }
    }

    fn should_exit(&self, done: &dyn Fn() -> bool) -> Option<Exit> {
        if done() {
            Some(Exit::Finished)
        } else if self.inner.stopping.get() {
            Some(Exit::Aborted)
        } else {
            None
        }
    }

    fn is_idle(&self) -> bool {
        self.inner.timers.borrow().is_empty()
            && self.inner.listeners.borrow().is_empty()
            && self.inner.closed.borrow().is_empty()
            && self.inner.ready.is_empty()
    }

    /// Turns woken tasks into zero-delay timers and merges pending timers.
    fn prepare_timers(&self) {
        for id in self.inner.ready.drain() {
            self.schedule_task(id);
        }
        self.inner.timers.borrow_mut().prepare();
    }

    fn fire_timers(&self, now: Instant) {
        loop {
            let slot = self.inner.timers.borrow_mut().pop_due(now);
            let Some(slot) = slot else {
                break;
            };

            if let Some(owner) = slot.owner() {
                let alive = self.inner.tasks.borrow().contains_key(&owner);
                if !alive {
                    slot.discard();
                    continue;
                }
            }

            if let Some(callback) = slot.take_callback() {
                self.inner.timers_fired.set(self.inner.timers_fired.get() + 1);
                self.invoke("timer", callback);
            }
        }
    }

    fn deliver_closed(&self) {
        let closed = std::mem::take(&mut *self.inner.closed.borrow_mut());
        for listener in closed {
            let tb = listener.tb.clone();
            self.invoke("close", move || tb(listener.fd));
        }
    }

    /// Removes every listener on a dead fd and runs their close callbacks.
    fn close_descriptor(&self, fd: RawFd) {
        let removed = self.inner.listeners.borrow_mut().remove_descriptor(fd);
        debug!(fd, listeners = removed.len(), "backend reported an invalid descriptor");

        for listener in removed {
            let tb = listener.tb.clone();
            self.invoke("close", move || tb(fd));
        }
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let wake_fd = self.inner.ready.read_fd();
        let mut interests = self.inner.listeners.borrow().interests();
        interests.push((wake_fd, Interest::READ));

        let mut events = std::mem::take(&mut *self.inner.events.borrow_mut());
        events.clear();

        self.inner.ready.set_polling(true);
        let timeout = if self.inner.ready.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        trace!(?timeout, fds = interests.len(), "hub waiting");
        let polled = self
            .inner
            .poller
            .borrow_mut()
            .poll(&interests, timeout, &mut events);
        self.inner.ready.set_polling(false);

        if let Err(err) = polled {
            error!(error = %err, "backend poll failed");
            *self.inner.events.borrow_mut() = events;
            return Err(err.into());
        }

        for event in events.drain(..) {
            if event.fd == wake_fd {
                self.inner.ready.clear_wakeups();
                continue;
            }

            if event.invalid {
                self.close_descriptor(event.fd);
                continue;
            }

            if event.readable {
                self.dispatch(Direction::Read, event.fd);
            }
            if event.writable {
                self.dispatch(Direction::Write, event.fd);
            }
        }

        *self.inner.events.borrow_mut() = events;
        Ok(())
    }

    /// Calls the listener registered for `fd` right now, if any.
    fn dispatch(&self, direction: Direction, fd: RawFd) {
        let listener = self.inner.listeners.borrow().get(direction, fd);
        if let Some(listener) = listener {
            let cb = listener.cb.clone();
            self.invoke(
                match direction {
                    Direction::Read => "read",
                    Direction::Write => "write",
                },
                move || cb(fd),
            );
        }
    }

    fn invoke(&self, what: &'static str, callback: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            self.inner
                .callback_errors
                .set(self.inner.callback_errors.get() + 1);

            let err = TaskError::from_panic(payload);
            if self.inner.config.debug_exceptions {
                error!(callback = what, error = %err, "hub callback failed");
            } else {
                debug!(callback = what, error = %err, "hub callback failed");
            }
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("backend", &self.backend())
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}
