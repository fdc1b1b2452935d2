//! Cooperative tasks.
//!
//! A task wraps a `'static` future and runs on the thread's hub. It is
//! started by a zero-delay timer, polled again every time its waker fires,
//! and finishes when the future returns, panics or is killed.
//!
//! # Spawning
//!
//! ```ignore
//! use greenhub::spawn;
//!
//! async fn example() {
//!     let handle = spawn(async { 40 + 2 });
//!     assert_eq!(handle.await, Ok(42));
//! }
//! ```
//!
//! [`spawn`] returns a [`JoinHandle`]: awaiting it yields the task's output,
//! or the [`TaskError`] that ended it. A panic inside a spawned task is kept
//! until someone awaits the handle. [`spawn_n`] discards the handle; a panic
//! in such a task is logged.
//!
//! # Killing
//!
//! [`JoinHandle::kill`] does not interrupt a task mid-poll. The task is
//! resumed once more and, instead of being polled, its future is dropped, so
//! every destructor in it runs. A task that was never started is finished on
//! the spot.
//!
//! # How Tasks Work
//!
//! 1. The future is wrapped in a [`TaskCell`] and a zero-delay timer is set
//! 2. The timer fires: the task registers with the hub and is polled
//! 3. When the future is pending, its waker records the task id
//! 4. The hub turns recorded ids into zero-delay timers on its next turn
//! 5. On completion the result is stored, links run, and waiters are woken

use crate::error::{Error, TaskError};
use crate::hub::{Hub, TimerHandle, WeakHub, get_hub};
use crate::runtime::context::{self, enter_task};
use crate::runtime::waker::make_waker;
use crate::sync::event::{Event, EventWait};

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Object-safe view of a task, as stored by the hub.
pub(crate) trait Runnable {
    fn id(&self) -> TaskId;

    /// Polls the task once (or drops it, if it was killed).
    fn run(self: Rc<Self>, hub: &Hub);

    fn is_scheduled(&self) -> bool;

    fn set_scheduled(&self, scheduled: bool);
}

type Link<T> = Box<dyn FnOnce(&Result<T, TaskError>)>;

/// Shared state of one task.
pub(crate) struct TaskCell<T> {
    id: TaskId,
    hub: WeakHub,
    future: RefCell<Option<LocalBoxFuture<'static, thread::Result<T>>>>,
    waker: RefCell<Option<Waker>>,
    result: RefCell<Option<Result<T, TaskError>>>,
    done: Event<()>,
    links: RefCell<Vec<Link<T>>>,
    start_timer: RefCell<Option<TimerHandle>>,
    started: Cell<bool>,
    killed: Cell<bool>,
    scheduled: Cell<bool>,
    running: Cell<bool>,
    finished: Cell<bool>,
    detached: bool,
}

impl<T: 'static> TaskCell<T> {
    fn new<F>(hub: &Hub, future: F, detached: bool) -> Rc<Self>
    where
        F: Future<Output = T> + 'static,
    {
        Rc::new(TaskCell {
            id: TaskId::next(),
            hub: hub.downgrade(),
            future: RefCell::new(Some(AssertUnwindSafe(future).catch_unwind().boxed_local())),
            waker: RefCell::new(None),
            result: RefCell::new(None),
            done: Event::new(),
            links: RefCell::new(Vec::new()),
            start_timer: RefCell::new(None),
            started: Cell::new(false),
            killed: Cell::new(false),
            scheduled: Cell::new(false),
            running: Cell::new(false),
            finished: Cell::new(false),
            detached,
        })
    }

    fn waker(&self, hub: &Hub) -> Waker {
        self.waker
            .borrow_mut()
            .get_or_insert_with(|| make_waker(self.id, hub.ready_queue()))
            .clone()
    }

    /// Stores the outcome, runs links and wakes everyone waiting on the task.
    fn finish(&self, result: Result<T, TaskError>) {
        if self.finished.replace(true) {
            return;
        }

        if let Some(timer) = self.start_timer.borrow_mut().take() {
            timer.cancel();
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister_task(self.id);
        }

        // Destructors inside the future may touch other primitives.
        let future = self.future.borrow_mut().take();
        if future.is_some() {
            enter_task(self.id, move || drop(future));
        }

        if self.detached {
            if let Err(TaskError::Panicked(message)) = &result {
                warn!(task = %self.id, panic = %message, "unhandled panic in detached task");
            }
        }

        let links = std::mem::take(&mut *self.links.borrow_mut());
        for link in links {
            link(&result);
        }

        trace!(task = %self.id, ok = result.is_ok(), "task finished");
        *self.result.borrow_mut() = Some(result);
        let _ = self.done.send(());
    }

    fn kill(&self) {
        if self.finished.get() {
            return;
        }
        self.killed.set(true);

        if !self.started.get() {
            self.finish(Err(TaskError::Killed));
            return;
        }

        // A running task is finished as soon as its current poll returns.
        if self.running.get() {
            return;
        }

        if let Some(hub) = self.hub.upgrade() {
            hub.schedule_task(self.id);
        }
    }
}

impl<T: 'static> Runnable for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(self: Rc<Self>, hub: &Hub) {
        if self.finished.get() {
            return;
        }
        self.started.set(true);

        if self.killed.get() {
            self.finish(Err(TaskError::Killed));
            return;
        }

        let future = self.future.borrow_mut().take();
        let Some(mut future) = future else {
            return;
        };

        let waker = self.waker(hub);
        let mut cx = Context::from_waker(&waker);

        self.running.set(true);
        let poll = enter_task(self.id, || future.as_mut().poll(&mut cx));
        self.running.set(false);

        match poll {
            Poll::Pending if self.killed.get() => {
                enter_task(self.id, move || drop(future));
                self.finish(Err(TaskError::Killed));
            }
            Poll::Pending => {
                *self.future.borrow_mut() = Some(future);
            }
            Poll::Ready(Ok(value)) => self.finish(Ok(value)),
            Poll::Ready(Err(payload)) => self.finish(Err(TaskError::from_panic(payload))),
        }
    }

    fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.set(scheduled);
    }
}

/// Handle to a spawned task.
///
/// Awaiting the handle yields the task's output. Dropping it detaches the
/// task, which keeps running.
///
/// # Example
/// ```ignore
/// let handle = spawn(async { "hi" });
/// assert_eq!(handle.await, Ok("hi"));
/// ```
pub struct JoinHandle<T> {
    task: Rc<TaskCell<T>>,
    waiting: Option<EventWait<()>>,
}

impl<T: 'static> JoinHandle<T> {
    fn new(task: Rc<TaskCell<T>>) -> Self {
        Self {
            task,
            waiting: None,
        }
    }

    /// A handle for work that already ran to completion.
    pub(crate) fn completed(result: Result<T, TaskError>) -> Self {
        let task = Rc::new(TaskCell {
            id: TaskId::next(),
            hub: WeakHub::default(),
            future: RefCell::new(None),
            waker: RefCell::new(None),
            result: RefCell::new(None),
            done: Event::new(),
            links: RefCell::new(Vec::new()),
            start_timer: RefCell::new(None),
            started: Cell::new(true),
            killed: Cell::new(false),
            scheduled: Cell::new(false),
            running: Cell::new(false),
            finished: Cell::new(false),
            detached: false,
        });
        task.finish(result);
        Self::new(task)
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.finished.get()
    }

    /// Waits for the task and returns its outcome.
    pub async fn wait(self) -> Result<T, TaskError> {
        self.await
    }

    /// Kills the task at its next resumption.
    ///
    /// Does nothing if the task already finished.
    pub fn kill(&self) {
        self.task.kill();
    }

    /// Kills the task only if it has not started yet.
    ///
    /// Returns `true` if the task was canceled.
    pub fn cancel(&self) -> bool {
        if self.task.started.get() || self.task.finished.get() {
            return false;
        }
        self.task.kill();
        true
    }

    /// Registers `callback` to run with the task's outcome when it finishes.
    ///
    /// Runs at once if the task already finished and its outcome has not
    /// been taken by awaiting the handle.
    pub fn link<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, TaskError>) + 'static,
    {
        if !self.task.finished.get() {
            self.task.links.borrow_mut().push(Box::new(callback));
            return;
        }

        let result = self.task.result.borrow();
        if let Some(result) = result.as_ref() {
            callback(result);
        }
    }

    /// Takes the outcome of a finished task.
    pub(crate) fn take_result(&self) -> Option<Result<T, TaskError>> {
        self.task.result.borrow_mut().take()
    }

    /// Finishes the task as killed right away, without going through the hub.
    pub(crate) fn abandon(&self) {
        self.task.killed.set(true);
        self.task.finish(Err(TaskError::Killed));
    }
}

impl<T: 'static> Future for JoinHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        loop {
            if this.task.done.ready() {
                this.waiting = None;
                let result = this
                    .task
                    .result
                    .borrow_mut()
                    .take()
                    .unwrap_or_else(|| panic!("{} polled after its result was taken", this.task.id));
                return Poll::Ready(result);
            }

            let task = &this.task;
            let waiting = this.waiting.get_or_insert_with(|| task.done.wait());
            match Pin::new(waiting).poll(cx) {
                Poll::Ready(_) => this.waiting = None,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.task.id)
            .field("started", &self.task.started.get())
            .field("finished", &self.task.finished.get())
            .finish()
    }
}

impl Hub {
    fn spawn_task<F, T>(
        &self,
        delay: Duration,
        owner: Option<TaskId>,
        future: F,
        detached: bool,
    ) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let task = TaskCell::new(self, future, detached);
        task.scheduled.set(true);

        let runnable: Rc<dyn Runnable> = task.clone();
        let hub = self.downgrade();
        let timer = self.schedule_at(
            Instant::now() + delay,
            owner,
            Box::new(move || {
                if let Some(hub) = hub.upgrade() {
                    runnable.set_scheduled(false);
                    hub.register_task(runnable.clone());
                    runnable.run(&hub);
                }
            }),
        );
        *task.start_timer.borrow_mut() = Some(timer);

        trace!(task = %task.id, ?delay, "task spawned");
        JoinHandle::new(task)
    }

    /// Spawns `future` as a new task on this hub.
    ///
    /// The task starts on a later loop turn; the caller keeps running.
    ///
    /// # Arguments
    /// * `future` - The work to run
    ///
    /// # Returns
    /// A [`JoinHandle`] resolving to the future's output.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn_task(Duration::ZERO, None, future, false)
    }

    /// Spawns `future` without keeping a handle. Panics are logged.
    pub fn spawn_n<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_task(Duration::ZERO, None, future, true);
    }

    /// Spawns `future` after `delay`.
    pub fn spawn_after<F, T>(&self, delay: Duration, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn_task(delay, None, future, false)
    }

    /// Spawns `future` after `delay`, unless the calling task has exited by
    /// then. A task that never starts never finishes either.
    pub fn spawn_after_local<F, T>(&self, delay: Duration, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn_task(delay, context::current_task(), future, false)
    }

    /// Like [`Hub::spawn_n`] but keeps the handle, marked as detached.
    pub(crate) fn spawn_detached<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_task(Duration::ZERO, None, future, true)
    }
}

/// Spawns a task on the current thread's hub.
///
/// # Example
/// ```ignore
/// let handle = spawn(async { 42 });
/// assert_eq!(handle.await, Ok(42));
/// ```
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_hub().spawn(future)
}

/// Spawns a task on the current thread's hub and forgets about it.
pub fn spawn_n<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    get_hub().spawn_n(future)
}

/// Spawns a task on the current thread's hub after `delay`.
pub fn spawn_after<F, T>(delay: Duration, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_hub().spawn_after(delay, future)
}

/// Spawns a task after `delay`, void if the caller exits first.
pub fn spawn_after_local<F, T>(delay: Duration, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_hub().spawn_after_local(delay, future)
}

/// Id of the running task, or `None` when called from hub context.
pub fn current_task() -> Option<TaskId> {
    context::current_task()
}

/// Returns [`Error::BlockingInHub`] unless called from inside a task.
pub(crate) fn ensure_task() -> Result<TaskId, Error> {
    context::current_task().ok_or(Error::BlockingInHub)
}
