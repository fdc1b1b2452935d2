//! Blocking queues: FIFO, LIFO and priority.
//!
//! A [`Queue`] holds at most `maxsize` items. `put` suspends while the queue
//! is full and `get` suspends while it is empty. With `maxsize == 0` the
//! queue is a rendezvous channel: every `put` waits until a `get` takes its
//! item directly.
//!
//! Waiters are paired by an unlock step that runs as a zero-delay timer,
//! never inside the call that made pairing possible. It repeats, until
//! nothing changes:
//!
//! 1. hand a stored item to the oldest waiting getter,
//! 2. with an empty store, pass an item straight from a putter to a getter,
//! 3. move a waiting putter's item into the store while there is room.
//!
//! A stored item handed to a getter keeps its slot reserved until the getter
//! collects it; if the getter gives up first (timeout, kill) the item goes
//! back to the front of the store. A direct hand-off leaves the item with its
//! putter until collection, so an abandoned one returns to the head of the
//! waiting putters and never lands in the store.

use crate::error::{Error, Result};
use crate::hub::get_hub;
use crate::sync::event::Event;
use crate::time::timeout;

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Ordering policy of a queue.
trait Store<T> {
    fn push(&mut self, item: T);

    fn pop(&mut self) -> Option<T>;

    /// Returns an item that a getter could not take, so it is served next.
    fn putback(&mut self, item: T);

    fn len(&self) -> usize;
}

struct Fifo<T>(VecDeque<T>);

impl<T> Store<T> for Fifo<T> {
    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn putback(&mut self, item: T) {
        self.0.push_front(item);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct Lifo<T>(Vec<T>);

impl<T> Store<T> for Lifo<T> {
    fn push(&mut self, item: T) {
        self.0.push(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop()
    }

    fn putback(&mut self, item: T) {
        self.0.push(item);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Smallest item first.
struct Priority<T>(BinaryHeap<Reverse<T>>);

impl<T: Ord> Store<T> for Priority<T> {
    fn push(&mut self, item: T) {
        self.0.push(Reverse(item));
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(item)| item)
    }

    fn putback(&mut self, item: T) {
        self.0.push(Reverse(item));
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct Getter<T> {
    /// Item taken from the store for this getter.
    item: RefCell<Option<T>>,
    /// Putter whose item this getter is to collect.
    from: RefCell<Option<Rc<Putter<T>>>>,
    waker: RefCell<Option<Waker>>,
}

impl<T> Getter<T> {
    fn new(waker: Waker) -> Rc<Self> {
        Rc::new(Self {
            item: RefCell::new(None),
            from: RefCell::new(None),
            waker: RefCell::new(Some(waker)),
        })
    }
}

/// `done` is set only once a getter has collected the item.
struct Putter<T> {
    item: RefCell<Option<T>>,
    done: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

fn wake(slot: &RefCell<Option<Waker>>) {
    if let Some(waker) = slot.borrow_mut().take() {
        waker.wake();
    }
}

struct QueueInner<T> {
    store: RefCell<Box<dyn Store<T>>>,
    maxsize: Cell<Option<usize>>,
    getters: RefCell<VecDeque<Rc<Getter<T>>>>,
    putters: RefCell<VecDeque<Rc<Putter<T>>>>,
    /// Stored items handed to getters and not collected yet.
    in_flight: Cell<usize>,
    unlock_scheduled: Cell<bool>,
    unfinished: Cell<usize>,
    all_done: RefCell<Event<()>>,
    this: Weak<QueueInner<T>>,
}

impl<T: 'static> QueueInner<T> {
    fn qsize(&self) -> usize {
        self.store.borrow().len()
    }

    fn has_room(&self) -> bool {
        self.maxsize
            .get()
            .is_none_or(|max| self.qsize() + self.in_flight.get() < max)
    }

    fn accept(&self, item: T) {
        self.store.borrow_mut().push(item);
        self.unfinished.set(self.unfinished.get() + 1);
    }

    /// Pairs a getter with a putter; the item moves at collection.
    fn assign(&self, getter: &Getter<T>, putter: Rc<Putter<T>>) {
        *getter.from.borrow_mut() = Some(putter);
        wake(&getter.waker);
    }

    /// A getter collected a stored item, freeing its reserved slot.
    fn collected(&self) {
        self.in_flight.set(self.in_flight.get().saturating_sub(1));
        if !self.putters.borrow().is_empty() {
            self.schedule_unlock();
        }
    }

    /// A getter collected a putter's item.
    fn delivered(&self, putter: &Putter<T>) {
        self.unfinished.set(self.unfinished.get() + 1);
        putter.done.set(true);
        wake(&putter.waker);
    }

    fn schedule_unlock(&self) {
        if self.unlock_scheduled.replace(true) {
            return;
        }

        let queue = self.this.clone();
        get_hub().schedule_call_global(Duration::ZERO, move || {
            if let Some(queue) = queue.upgrade() {
                queue.unlock_scheduled.set(false);
                queue.unlock();
            }
        });
    }

    fn unlock(&self) {
        loop {
            let has_items = self.qsize() > 0;
            let has_getters = !self.getters.borrow().is_empty();
            let has_putters = !self.putters.borrow().is_empty();

            if has_items && has_getters {
                let getter = self.getters.borrow_mut().pop_front();
                let item = self.store.borrow_mut().pop();
                if let (Some(getter), Some(item)) = (getter, item) {
                    self.in_flight.set(self.in_flight.get() + 1);
                    *getter.item.borrow_mut() = Some(item);
                    wake(&getter.waker);
                }
            } else if has_putters && has_getters {
                let putter = self.putters.borrow_mut().pop_front();
                let getter = self.getters.borrow_mut().pop_front();
                if let (Some(putter), Some(getter)) = (putter, getter) {
                    self.assign(&getter, putter);
                }
            } else if has_putters && self.has_room() {
                let putter = self.putters.borrow_mut().pop_front();
                if let Some(putter) = putter {
                    let item = putter.item.borrow_mut().take();
                    if let Some(item) = item {
                        self.accept(item);
                    }
                    putter.done.set(true);
                    wake(&putter.waker);
                }
            } else {
                break;
            }
        }
    }
}

/// A blocking queue shared between tasks.
///
/// Cloning gives another handle to the same queue.
///
/// # Example
/// ```ignore
/// let queue = Queue::new(1);
/// let consumer = queue.clone();
/// spawn(async move { assert_eq!(consumer.get().await, "ping") });
/// queue.put("ping").await;
/// ```
pub struct Queue<T> {
    inner: Rc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Queue<T> {
    fn with_store(store: Box<dyn Store<T>>, maxsize: Option<usize>) -> Self {
        Self {
            inner: Rc::new_cyclic(|this| QueueInner {
                store: RefCell::new(store),
                maxsize: Cell::new(maxsize),
                getters: RefCell::new(VecDeque::new()),
                putters: RefCell::new(VecDeque::new()),
                in_flight: Cell::new(0),
                unlock_scheduled: Cell::new(false),
                unfinished: Cell::new(0),
                all_done: RefCell::new(Event::new()),
                this: this.clone(),
            }),
        }
    }

    /// FIFO queue holding at most `maxsize` items; `0` makes a channel.
    pub fn new(maxsize: usize) -> Self {
        Self::with_store(Box::new(Fifo(VecDeque::new())), Some(maxsize))
    }

    /// FIFO queue on which `put` never blocks.
    pub fn unbounded() -> Self {
        Self::with_store(Box::new(Fifo(VecDeque::new())), None)
    }

    /// Last-in first-out queue.
    pub fn lifo(maxsize: Option<usize>) -> Self {
        Self::with_store(Box::new(Lifo(Vec::new())), maxsize)
    }

    /// Queue returning the smallest item first.
    pub fn priority(maxsize: Option<usize>) -> Self
    where
        T: Ord,
    {
        Self::with_store(Box::new(Priority(BinaryHeap::new())), maxsize)
    }

    /// Number of items stored.
    pub fn qsize(&self) -> usize {
        self.inner.qsize()
    }

    pub fn is_empty(&self) -> bool {
        self.qsize() == 0
    }

    /// True if a `put` would have to wait. Items handed to a getter but not
    /// collected yet still count.
    pub fn is_full(&self) -> bool {
        !self.inner.has_room()
    }

    /// `None` for an unbounded queue.
    pub fn maxsize(&self) -> Option<usize> {
        self.inner.maxsize.get()
    }

    /// Changes the capacity. Growing it releases waiting putters.
    pub fn resize(&self, maxsize: Option<usize>) {
        let grows = match (self.inner.maxsize.get(), maxsize) {
            (Some(old), Some(new)) => new > old,
            (Some(_), None) => true,
            (None, _) => false,
        };

        self.inner.maxsize.set(maxsize);
        if grows && !self.inner.putters.borrow().is_empty() {
            self.inner.schedule_unlock();
        }
    }

    /// Tasks blocked in `get`.
    pub fn getting(&self) -> usize {
        self.inner.getters.borrow().len()
    }

    /// Puts waiting for room, including hand-offs returned by a getter that
    /// gave up.
    pub fn putting(&self) -> usize {
        self.inner.putters.borrow().len()
    }

    /// Puts `item`, waiting for room if the queue is full.
    pub fn put(&self, item: T) -> Put<T> {
        Put {
            queue: self.inner.clone(),
            item: Some(item),
            putter: None,
        }
    }

    /// Like [`Queue::put`], giving up with [`Error::Full`] after `duration`.
    pub async fn put_timeout(&self, item: T, duration: Duration) -> Result<()> {
        timeout(duration, self.put(item))
            .await
            .map_err(|_| Error::Full)
    }

    /// Puts `item` only if that can happen without waiting.
    ///
    /// On a channel, succeeds when a getter is already waiting. Should that
    /// getter give up, the item waits for the next one without being stored.
    ///
    /// # Errors
    /// [`Error::Full`] if there is no room and no getter to hand it to.
    pub fn put_nowait(&self, item: T) -> Result<()> {
        let inner = &self.inner;

        if inner.has_room() {
            inner.accept(item);
            if !inner.getters.borrow().is_empty() {
                inner.schedule_unlock();
            }
            return Ok(());
        }

        if inner.qsize() == 0 {
            let getter = inner.getters.borrow_mut().pop_front();
            if let Some(getter) = getter {
                let putter = Rc::new(Putter {
                    item: RefCell::new(Some(item)),
                    done: Cell::new(false),
                    waker: RefCell::new(None),
                });
                inner.assign(&getter, putter);
                return Ok(());
            }
        }

        Err(Error::Full)
    }

    /// Takes an item, waiting until one is available.
    pub fn get(&self) -> Get<T> {
        Get {
            queue: self.inner.clone(),
            getter: None,
        }
    }

    /// Like [`Queue::get`], giving up with [`Error::Empty`] after `duration`.
    pub async fn get_timeout(&self, duration: Duration) -> Result<T> {
        timeout(duration, self.get())
            .await
            .map_err(|_| Error::Empty)
    }

    /// Takes an item only if that can happen without waiting.
    ///
    /// # Errors
    /// [`Error::Empty`] if there is no item and no putter waiting.
    pub fn get_nowait(&self) -> Result<T> {
        let inner = &self.inner;

        let item = inner.store.borrow_mut().pop();
        if let Some(item) = item {
            if !inner.putters.borrow().is_empty() {
                inner.schedule_unlock();
            }
            return Ok(item);
        }

        let putter = inner.putters.borrow_mut().pop_front();
        if let Some(putter) = putter {
            let item = putter.item.borrow_mut().take();
            if let Some(item) = item {
                inner.delivered(&putter);
                return Ok(item);
            }
        }

        Err(Error::Empty)
    }

    /// Items put and not yet confirmed with [`Queue::task_done`].
    pub fn unfinished_tasks(&self) -> usize {
        self.inner.unfinished.get()
    }

    /// Marks one previously fetched item as processed.
    ///
    /// # Errors
    /// [`Error::TaskDoneTooManyTimes`] if every item was already confirmed.
    pub fn task_done(&self) -> Result<()> {
        let unfinished = self.inner.unfinished.get();
        if unfinished == 0 {
            return Err(Error::TaskDoneTooManyTimes);
        }

        self.inner.unfinished.set(unfinished - 1);
        if unfinished == 1 {
            let done = std::mem::take(&mut *self.inner.all_done.borrow_mut());
            done.send(())?;
        }
        Ok(())
    }

    /// Waits until every item put so far has been confirmed.
    pub async fn join(&self) {
        while self.inner.unfinished.get() > 0 {
            let done = self.inner.all_done.borrow().clone();
            let _ = done.wait().await;
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("qsize", &self.inner.store.borrow().len())
            .field("maxsize", &self.inner.maxsize.get())
            .field("getters", &self.inner.getters.borrow().len())
            .field("putters", &self.inner.putters.borrow().len())
            .finish()
    }
}

/// Future returned by [`Queue::put`].
pub struct Put<T> {
    queue: Rc<QueueInner<T>>,
    item: Option<T>,
    putter: Option<Rc<Putter<T>>>,
}

// The item is only ever moved, never pinned.
impl<T> Unpin for Put<T> {}

impl<T: 'static> Future for Put<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;

        if let Some(putter) = &this.putter {
            if putter.done.get() {
                this.putter = None;
                return Poll::Ready(());
            }
            *putter.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let Some(item) = this.item.take() else {
            return Poll::Ready(());
        };
        let queue = &this.queue;

        if queue.has_room() {
            queue.accept(item);
            if !queue.getters.borrow().is_empty() {
                queue.schedule_unlock();
            }
            return Poll::Ready(());
        }

        let putter = Rc::new(Putter {
            item: RefCell::new(Some(item)),
            done: Cell::new(false),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        queue.putters.borrow_mut().push_back(putter.clone());
        if !queue.getters.borrow().is_empty() {
            queue.schedule_unlock();
        }

        this.putter = Some(putter);
        Poll::Pending
    }
}

impl<T> Drop for Put<T> {
    fn drop(&mut self) {
        if let Some(putter) = self.putter.take() {
            if !putter.done.get() {
                self.queue
                    .putters
                    .borrow_mut()
                    .retain(|other| !Rc::ptr_eq(other, &putter));
                // A getter paired with us finds nothing and queues up again.
                let _ = putter.item.borrow_mut().take();
            }
        }
    }
}

/// Future returned by [`Queue::get`].
pub struct Get<T: 'static> {
    queue: Rc<QueueInner<T>>,
    getter: Option<Rc<Getter<T>>>,
}

impl<T: 'static> Future for Get<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        let queue = &this.queue;

        if let Some(getter) = this.getter.clone() {
            let item = getter.item.borrow_mut().take();
            if let Some(item) = item {
                this.getter = None;
                queue.collected();
                return Poll::Ready(item);
            }

            *getter.waker.borrow_mut() = Some(cx.waker().clone());
            let putter = getter.from.borrow_mut().take();
            if let Some(putter) = putter {
                let item = putter.item.borrow_mut().take();
                if let Some(item) = item {
                    this.getter = None;
                    queue.delivered(&putter);
                    return Poll::Ready(item);
                }

                // The putter gave up first: wait again, ahead of later getters.
                queue.getters.borrow_mut().push_front(getter);
                if !queue.putters.borrow().is_empty() || queue.qsize() > 0 {
                    queue.schedule_unlock();
                }
            }
            return Poll::Pending;
        }

        let item = queue.store.borrow_mut().pop();
        if let Some(item) = item {
            if !queue.putters.borrow().is_empty() {
                queue.schedule_unlock();
            }
            return Poll::Ready(item);
        }

        let getter = Getter::new(cx.waker().clone());
        queue.getters.borrow_mut().push_back(getter.clone());
        if !queue.putters.borrow().is_empty() {
            queue.schedule_unlock();
        }

        this.getter = Some(getter);
        Poll::Pending
    }
}

impl<T: 'static> Drop for Get<T> {
    fn drop(&mut self) {
        let Some(getter) = self.getter.take() else {
            return;
        };

        self.queue
            .getters
            .borrow_mut()
            .retain(|other| !Rc::ptr_eq(other, &getter));

        let queue = &self.queue;
        let mut returned = false;

        // A stored item goes back into the slot it still holds.
        let item = getter.item.borrow_mut().take();
        if let Some(item) = item {
            queue.in_flight.set(queue.in_flight.get().saturating_sub(1));
            queue.store.borrow_mut().putback(item);
            returned = true;
        }

        // A hand-off goes back to the head of the putters.
        let putter = getter.from.borrow_mut().take();
        if let Some(putter) = putter {
            if putter.item.borrow().is_some() {
                queue.putters.borrow_mut().push_front(putter);
                returned = true;
            }
        }

        if returned && !queue.getters.borrow().is_empty() {
            queue.schedule_unlock();
        }
    }
}
