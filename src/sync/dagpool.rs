//! Dependency-graph pool.
//!
//! A [`DagPool`] is a keyed store of values. Each key gets its value either
//! from a producer task started with [`DagPool::spawn`], which declares the
//! keys it depends on, or from an explicit [`DagPool::post`]. Producers
//! receive their dependencies as a stream, in the order the values become
//! available.
//!
//! A key has at most one producer. Spawning a second producer for a key, or
//! posting to a key that already has a value, is a [`DagError::Collision`].
//!
//! A producer that fails (returns an error or panics) stores a
//! [`PropagateError`] as its key's value. Consumers see that error while
//! iterating their dependencies; if they fail with it in turn, the errors
//! nest, and [`PropagateError::keys`] recovers the whole failure path.
//!
//! # Example
//!
//! ```ignore
//! let pool = DagPool::with_preload([("a", 1), ("b", 2)]);
//! pool.spawn("c", ["a", "b"], |_key, mut deps| async move {
//!     let mut sum = 0;
//!     while let Some(item) = deps.next().await {
//!         let (_, value) = item?;
//!         sum += value;
//!     }
//!     Ok::<_, PropagateError<&str>>(sum)
//! })?;
//! assert_eq!(pool.get_value("c").await?, 3);
//! ```

use crate::error::TaskError;
use crate::sync::event::{Event, EventWait};
use crate::task::{JoinHandle, current_task, spawn as spawn_task};

use futures::{FutureExt, Stream, StreamExt, future};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// A producer's failure, tagged with the key it was producing.
#[derive(Clone)]
pub struct PropagateError<K> {
    key: K,
    cause: Rc<dyn StdError>,
}

impl<K> PropagateError<K> {
    pub fn new(key: K, cause: Rc<dyn StdError>) -> Self {
        Self { key, cause }
    }

    /// Key whose producer failed.
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn cause(&self) -> &(dyn StdError + 'static) {
        &*self.cause
    }
}

impl<K: fmt::Debug + Clone + 'static> PropagateError<K> {
    /// Keys along the failure path, outermost first.
    ///
    /// The first key is this error's own; the last one belongs to the
    /// producer where the failure started.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(propagated) = err.downcast_ref::<Self>() {
                keys.push(propagated.key.clone());
            }
            current = err.source();
        }
        keys
    }
}

impl<K: fmt::Debug> fmt::Debug for PropagateError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagateError")
            .field("key", &self.key)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

impl<K: fmt::Debug> fmt::Display for PropagateError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer for {:?} failed: {}", self.key, self.cause)
    }
}

impl<K: fmt::Debug + 'static> StdError for PropagateError<K> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.cause)
    }
}

/// Errors raised by [`DagPool`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DagError<K: fmt::Debug + 'static> {
    /// The key already has a producer or a value.
    #[error("key {0:?} already has a producer or a value")]
    Collision(K),

    /// No producer is running for the key and it has no value.
    #[error("key {0:?} is unknown")]
    KeyNotFound(K),

    /// The key's producer failed.
    #[error(transparent)]
    Propagate(#[from] PropagateError<K>),
}

type Stored<K, V> = Result<V, PropagateError<K>>;

struct Coro<K> {
    handle: JoinHandle<()>,
    depends: HashSet<K>,
}

struct DagInner<K, V> {
    values: RefCell<HashMap<K, Stored<K, V>>>,
    coros: RefCell<HashMap<K, Coro<K>>>,
    /// Sent after every post, then replaced by a fresh one.
    posted: RefCell<Event<()>>,
}

impl<K, V> DagInner<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    fn post(&self, key: K, value: Stored<K, V>, replace: bool) -> Result<(), DagError<K>> {
        {
            let coros = self.coros.borrow();
            if let Some(coro) = coros.get(&key) {
                if current_task() != Some(coro.handle.id()) {
                    return Err(DagError::Collision(key));
                }
            }
        }

        {
            let mut values = self.values.borrow_mut();
            if values.contains_key(&key) && !replace {
                return Err(DagError::Collision(key));
            }
            trace!(key = ?key, ok = value.is_ok(), "dag value posted");
            values.insert(key, value);
        }

        let posted = std::mem::take(&mut *self.posted.borrow_mut());
        let _ = posted.send(());
        Ok(())
    }

    fn remaining(&self, coro: &Coro<K>) -> HashSet<K> {
        let values = self.values.borrow();
        coro.depends
            .iter()
            .filter(|key| !values.contains_key(*key))
            .cloned()
            .collect()
    }
}

/// A keyed store whose values are produced by tasks depending on each other.
pub struct DagPool<K, V> {
    inner: Rc<DagInner<K, V>>,
}

impl<K, V> Clone for DagPool<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for DagPool<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DagPool<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    pub fn new() -> Self {
        Self::with_preload(std::iter::empty())
    }

    /// A pool whose keys already hold the given values.
    pub fn with_preload<I>(preload: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let values = preload
            .into_iter()
            .map(|(key, value)| (key, Ok(value)))
            .collect();

        Self {
            inner: Rc::new(DagInner {
                values: RefCell::new(values),
                coros: RefCell::new(HashMap::new()),
                posted: RefCell::new(Event::new()),
            }),
        }
    }

    /// Starts a producer task for `key`.
    ///
    /// `producer` is called with the key and a [`WaitEach`] stream over
    /// `depends`. Its output becomes the key's value, unless the producer
    /// already posted one itself. An error or a panic is stored as a
    /// [`PropagateError`].
    ///
    /// # Errors
    /// [`DagError::Collision`] if `key` already has a producer or a value.
    pub fn spawn<D, F, Fut, E>(&self, key: K, depends: D, producer: F) -> Result<(), DagError<K>>
    where
        D: IntoIterator<Item = K>,
        F: FnOnce(K, WaitEach<K, V>) -> Fut,
        Fut: Future<Output = Result<V, E>> + 'static,
        E: Into<Box<dyn StdError>>,
    {
        if self.inner.coros.borrow().contains_key(&key)
            || self.inner.values.borrow().contains_key(&key)
        {
            return Err(DagError::Collision(key));
        }

        let depends: Vec<K> = depends.into_iter().collect();
        let work = producer(key.clone(), self.wait_each(depends.iter().cloned()));

        let inner = self.inner.clone();
        let produced = key.clone();
        let handle = spawn_task(async move {
            let outcome = AssertUnwindSafe(work).catch_unwind().await;
            let value = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    let cause: Box<dyn StdError> = err.into();
                    Err(PropagateError::new(produced.clone(), Rc::from(cause)))
                }
                Err(payload) => Err(PropagateError::new(
                    produced.clone(),
                    Rc::new(TaskError::from_panic(payload)),
                )),
            };

            inner.coros.borrow_mut().remove(&produced);
            // The producer may have posted its own value already.
            let _ = inner.post(produced, value, false);
        });

        debug!(key = ?key, task = %handle.id(), "dag producer spawned");
        self.inner.coros.borrow_mut().insert(
            key,
            Coro {
                handle,
                depends: depends.into_iter().collect(),
            },
        );
        Ok(())
    }

    /// Spawns `producer` once per `(key, depends)` entry.
    ///
    /// Stops at the first collision; producers spawned before it keep
    /// running.
    pub fn spawn_many<I, D, F, Fut, E>(&self, entries: I, producer: F) -> Result<(), DagError<K>>
    where
        I: IntoIterator<Item = (K, D)>,
        D: IntoIterator<Item = K>,
        F: Fn(K, WaitEach<K, V>) -> Fut + Clone,
        Fut: Future<Output = Result<V, E>> + 'static,
        E: Into<Box<dyn StdError>>,
    {
        for (key, depends) in entries {
            self.spawn(key, depends, producer.clone())?;
        }
        Ok(())
    }

    /// Stores `value` for `key` and wakes everyone waiting on the pool.
    ///
    /// A producer may post its own key, after which its return value is
    /// discarded.
    ///
    /// # Errors
    /// [`DagError::Collision`] if another task's producer owns `key`, or if
    /// `key` has a value and `replace` is false.
    pub fn post(&self, key: K, value: V, replace: bool) -> Result<(), DagError<K>> {
        self.inner.post(key, Ok(value), replace)
    }

    /// Kills the producer of `key`. The key is left without a value, as if
    /// it had never been spawned.
    ///
    /// # Errors
    /// [`DagError::KeyNotFound`] if no producer is running for `key`.
    pub fn kill(&self, key: &K) -> Result<(), DagError<K>> {
        let coro = self.inner.coros.borrow_mut().remove(key);
        let Some(coro) = coro else {
            return Err(DagError::KeyNotFound(key.clone()));
        };

        debug!(key = ?key, task = %coro.handle.id(), "dag producer killed");
        coro.handle.kill();
        Ok(())
    }

    /// The value stored for `key`, without waiting.
    pub fn get(&self, key: &K) -> Option<Result<V, PropagateError<K>>> {
        self.inner.values.borrow().get(key).cloned()
    }

    /// Waits until `key` has a value and returns it.
    ///
    /// # Errors
    /// [`DagError::Propagate`] if the key's producer failed.
    pub async fn get_value(&self, key: K) -> Result<V, DagError<K>> {
        let mut values = self.wait([key.clone()]).await?;
        values.remove(&key).ok_or(DagError::KeyNotFound(key))
    }

    /// Keys that hold a value.
    pub fn keys(&self) -> Vec<K> {
        self.inner.values.borrow().keys().cloned().collect()
    }

    pub fn items(&self) -> Vec<(K, Result<V, PropagateError<K>>)> {
        self.inner
            .values
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Producers still running.
    pub fn running(&self) -> usize {
        self.inner.coros.borrow().len()
    }

    pub fn running_keys(&self) -> Vec<K> {
        self.inner.coros.borrow().keys().cloned().collect()
    }

    /// Running producers with at least one dependency still missing.
    pub fn waiting(&self) -> usize {
        self.inner
            .coros
            .borrow()
            .values()
            .filter(|coro| !self.inner.remaining(coro).is_empty())
            .count()
    }

    /// Dependencies of `key`'s producer that have no value yet. Empty when
    /// `key` already has a value.
    ///
    /// # Errors
    /// [`DagError::KeyNotFound`] if `key` has neither a producer nor a value.
    pub fn waiting_for(&self, key: &K) -> Result<HashSet<K>, DagError<K>> {
        if let Some(coro) = self.inner.coros.borrow().get(key) {
            return Ok(self.inner.remaining(coro));
        }
        if self.inner.values.borrow().contains_key(key) {
            return Ok(HashSet::new());
        }
        Err(DagError::KeyNotFound(key.clone()))
    }

    /// Missing dependencies of every running producer still waiting.
    pub fn waiting_for_all(&self) -> HashMap<K, HashSet<K>> {
        self.inner
            .coros
            .borrow()
            .iter()
            .map(|(key, coro)| (key.clone(), self.inner.remaining(coro)))
            .filter(|(_, missing)| !missing.is_empty())
            .collect()
    }

    /// Stream of `keys` and their values, as the values become available.
    pub fn wait_each<I>(&self, keys: I) -> WaitEach<K, V>
    where
        I: IntoIterator<Item = K>,
    {
        let mut seen = HashSet::new();
        let pending = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();

        WaitEach {
            pool: self.inner.clone(),
            pending,
            waiting: None,
        }
    }

    /// Like [`DagPool::wait_each`], skipping failed keys.
    pub fn wait_each_success<I>(&self, keys: I) -> impl Stream<Item = (K, V)> + use<I, K, V>
    where
        I: IntoIterator<Item = K>,
    {
        self.wait_each(keys)
            .filter_map(|item| future::ready(item.ok()))
    }

    /// Like [`DagPool::wait_each`], yielding only failed keys.
    pub fn wait_each_exception<I>(
        &self,
        keys: I,
    ) -> impl Stream<Item = (K, PropagateError<K>)> + use<I, K, V>
    where
        I: IntoIterator<Item = K>,
    {
        self.wait_each(keys)
            .filter_map(|item| future::ready(item.err().map(|err| (err.key.clone(), err))))
    }

    /// Waits for every key in `keys`.
    ///
    /// # Errors
    /// The first [`PropagateError`] met, in the order values arrive.
    pub async fn wait<I>(&self, keys: I) -> Result<HashMap<K, V>, PropagateError<K>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut stream = self.wait_each(keys);
        let mut values = HashMap::new();
        while let Some(item) = stream.next().await {
            let (key, value) = item?;
            values.insert(key, value);
        }
        Ok(values)
    }

    /// Waits for every key that has a value or a running producer.
    pub async fn waitall(&self) -> Result<HashMap<K, V>, PropagateError<K>> {
        let mut keys = self.keys();
        keys.extend(self.running_keys());
        self.wait(keys).await
    }
}

impl<K: fmt::Debug, V> fmt::Debug for DagPool<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagPool")
            .field("values", &self.inner.values.borrow().len())
            .field("running", &self.inner.coros.borrow().len())
            .finish()
    }
}

/// Stream returned by [`DagPool::wait_each`].
///
/// Yields each requested key once, as soon as it has a value. Keys that are
/// already available when polled come out in the order they were requested.
pub struct WaitEach<K, V> {
    pool: Rc<DagInner<K, V>>,
    pending: Vec<K>,
    waiting: Option<EventWait<()>>,
}

impl<K, V> Unpin for WaitEach<K, V> {}

impl<K, V> WaitEach<K, V> {
    /// Keys not yielded yet.
    pub fn pending(&self) -> &[K] {
        &self.pending
    }
}

impl<K, V> Stream for WaitEach<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    type Item = Result<(K, V), PropagateError<K>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if this.pending.is_empty() {
                this.waiting = None;
                return Poll::Ready(None);
            }

            let found = {
                let values = this.pool.values.borrow();
                this.pending
                    .iter()
                    .position(|key| values.contains_key(key))
                    .and_then(|index| {
                        let value = values.get(&this.pending[index]).cloned()?;
                        Some((index, value))
                    })
            };
            if let Some((index, value)) = found {
                this.waiting = None;
                let key = this.pending.remove(index);
                return Poll::Ready(Some(value.map(|value| (key, value))));
            }

            let pool = &this.pool;
            let waiting = this
                .waiting
                .get_or_insert_with(|| pool.posted.borrow().wait());
            match Pin::new(waiting).poll(cx) {
                Poll::Ready(_) => this.waiting = None,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
