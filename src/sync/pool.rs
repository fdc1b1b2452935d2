//! Bounded-concurrency task pool.
//!
//! A [`Pool`] runs at most `size` tasks at once. Spawning into a full pool
//! waits for a slot, except when the caller is itself one of the pool's
//! tasks: then the new work runs inline, in the caller, so that recursive
//! spawning cannot deadlock the pool.

use crate::error::{Error, Result, TaskError};
use crate::hub::{Hub, get_hub};
use crate::sync::event::Event;
use crate::sync::semaphore::Semaphore;
use crate::task::{JoinHandle, TaskId, current_task};

use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use tracing::warn;

struct PoolInner {
    size: Cell<usize>,
    semaphore: Semaphore,
    running: RefCell<HashSet<TaskId>>,
    idle: RefCell<Event<()>>,
}

impl PoolInner {
    fn started(&self, id: TaskId) {
        let mut running = self.running.borrow_mut();
        if running.is_empty() && self.idle.borrow().ready() {
            *self.idle.borrow_mut() = Event::new();
        }
        running.insert(id);
    }

    fn finished(&self, id: TaskId) {
        let _ = self.semaphore.release();

        let now_idle = {
            let mut running = self.running.borrow_mut();
            running.remove(&id);
            running.is_empty()
        };
        if now_idle {
            let _ = self.idle.borrow().send(());
        }
    }

    fn is_member(&self, id: Option<TaskId>) -> bool {
        id.is_some_and(|id| self.running.borrow().contains(&id))
    }
}

/// A pool of at most `size` concurrently running tasks.
///
/// # Example
/// ```ignore
/// let pool = Pool::new(10);
/// for url in urls {
///     pool.spawn_n(fetch(url)).await;
/// }
/// pool.waitall().await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Rc<PoolInner>,
}

impl Pool {
    pub fn new(size: usize) -> Self {
        let idle = Event::new();
        let _ = idle.send(());

        Self {
            inner: Rc::new(PoolInner {
                size: Cell::new(size),
                semaphore: Semaphore::new(size),
                running: RefCell::new(HashSet::new()),
                idle: RefCell::new(idle),
            }),
        }
    }

    /// Maximum number of concurrent tasks.
    pub fn size(&self) -> usize {
        self.inner.size.get()
    }

    /// Changes the number of slots. Running tasks are not affected; if the
    /// pool shrinks below them, new spawns wait until enough have finished.
    pub fn resize(&self, size: usize) {
        self.inner.semaphore.resize(size);
        self.inner.size.set(size);
    }

    /// Tasks currently running in the pool.
    pub fn running(&self) -> usize {
        self.inner.running.borrow().len()
    }

    /// Slots a spawn could take right now without waiting.
    pub fn free(&self) -> usize {
        usize::try_from(self.inner.semaphore.available()).unwrap_or(0)
    }

    /// Spawners waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.inner.semaphore.waiting()
    }

    fn saturated_member(&self) -> bool {
        self.inner.semaphore.locked() && self.inner.is_member(current_task())
    }

    async fn launch<S, T>(&self, start: S) -> JoinHandle<T>
    where
        S: FnOnce(&Hub) -> JoinHandle<T>,
        T: 'static,
    {
        self.inner.semaphore.acquire().await;

        let handle = start(&get_hub());

        let id = handle.id();
        self.inner.started(id);

        let pool: Weak<PoolInner> = Rc::downgrade(&self.inner);
        handle.link(move |_| {
            if let Some(pool) = pool.upgrade() {
                pool.finished(id);
            }
        });
        handle
    }

    /// Runs `future` as a pool task, waiting for a free slot first.
    ///
    /// Called from one of the pool's own tasks while the pool is full, the
    /// future runs to completion inside the caller instead, and the returned
    /// handle is already finished.
    pub async fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        if self.saturated_member() {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(TaskError::from_panic);
            return JoinHandle::completed(result);
        }

        self.launch(|hub| hub.spawn(future)).await
    }

    /// Like [`Pool::spawn`] without a handle; panics are logged.
    pub async fn spawn_n<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        if self.saturated_member() {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                warn!(error = %TaskError::from_panic(payload), "unhandled panic in inline pool work");
            }
            return;
        }

        self.launch(|hub| hub.spawn_detached(future)).await;
    }

    /// Waits until no task is running in the pool.
    ///
    /// # Errors
    /// [`Error::WaitallFromMember`] when called from one of the pool's own
    /// tasks, which would wait for itself.
    pub async fn waitall(&self) -> Result<()> {
        if self.inner.is_member(current_task()) {
            return Err(Error::WaitallFromMember);
        }

        while !self.inner.running.borrow().is_empty() {
            let idle = self.inner.idle.borrow().clone();
            let _ = idle.wait().await;
        }
        Ok(())
    }

    /// Creates an empty [`Pile`] feeding this pool.
    pub fn pile<T: 'static>(&self) -> Pile<T> {
        Pile {
            pool: self.clone(),
            handles: VecDeque::new(),
        }
    }

    /// Runs `function` over every item through the pool.
    ///
    /// Returns once every item has been spawned (which may wait for slots);
    /// the pile yields the results in input order.
    pub async fn imap<I, F, Fut, T>(&self, items: I, function: F) -> Pile<T>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let mut pile = self.pile();
        for item in items {
            pile.spawn(function(item)).await;
        }
        pile
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Results of pool tasks, collected in spawn order.
///
/// # Example
/// ```ignore
/// let mut pile = pool.pile();
/// for n in 0..3 {
///     pile.spawn(async move { n * 2 }).await;
/// }
/// while let Some(result) = pile.next().await {
///     println!("{result:?}");
/// }
/// ```
pub struct Pile<T> {
    pool: Pool,
    handles: VecDeque<JoinHandle<T>>,
}

impl<T: 'static> Pile<T> {
    pub async fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + 'static,
    {
        let handle = self.pool.spawn(future).await;
        self.handles.push_back(handle);
    }

    /// Outcome of the oldest task not yet returned, `None` once all are.
    pub async fn next(&mut self) -> Option<std::result::Result<T, TaskError>> {
        let handle = self.handles.pop_front()?;
        Some(handle.await)
    }

    /// Tasks whose outcome has not been returned yet.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
