//! Deadline-ordered timer heap.
//!
//! Timers fire in non-decreasing deadline order, ties broken by insertion
//! order. Timers scheduled while the hub is firing land in a pending list and
//! only join the heap at the next [`TimerHeap::prepare`], so a zero-delay
//! timer scheduled from a timer callback always waits for the next loop turn.
//!
//! Canceled timers stay in the heap and are skipped when they reach the top.
//! Once the heap is large and at least half of it is canceled, it is rebuilt
//! without them.

use crate::task::TaskId;

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Heap size above which canceled entries are compacted away.
const COMPACT_MIN_LEN: usize = 1000;

pub(crate) type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Counters {
    /// Canceled entries still stored in the heap or pending list.
    stored_canceled: Cell<usize>,
    /// Every cancellation since the hub was created.
    total_canceled: Cell<u64>,
}

pub(crate) struct TimerSlot {
    deadline: Instant,
    owner: Option<TaskId>,
    callback: RefCell<Option<Callback>>,
    canceled: Cell<bool>,
    called: Cell<bool>,
    counters: Rc<Counters>,
}

impl TimerSlot {
    pub(crate) fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Marks the timer as fired and hands out its callback.
    pub(crate) fn take_callback(&self) -> Option<Callback> {
        self.called.set(true);
        self.callback.borrow_mut().take()
    }

    /// Drops the callback of a timer that will never fire.
    pub(crate) fn discard(&self) {
        self.called.set(true);
        drop(self.callback.borrow_mut().take());
    }

    fn cancel(&self) {
        if self.canceled.get() || self.called.get() {
            return;
        }

        self.canceled.set(true);
        self.counters
            .stored_canceled
            .set(self.counters.stored_canceled.get() + 1);
        self.counters
            .total_canceled
            .set(self.counters.total_canceled.get() + 1);

        // Release whatever the callback captured right away.
        drop(self.callback.borrow_mut().take());
    }
}

/// Handle to a scheduled callback.
///
/// Dropping the handle does not cancel the timer.
#[derive(Clone)]
pub struct TimerHandle {
    slot: Rc<TimerSlot>,
}

impl TimerHandle {
    /// Prevents the callback from running. Calling it again, or after the
    /// timer fired, does nothing.
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    /// True until the timer fires or is canceled.
    pub fn is_pending(&self) -> bool {
        !self.slot.called.get() && !self.slot.canceled.get()
    }

    pub fn is_canceled(&self) -> bool {
        self.slot.canceled.get()
    }

    /// Absolute time at which the callback is due.
    pub fn deadline(&self) -> Instant {
        self.slot.deadline
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("deadline", &self.slot.deadline)
            .field("owner", &self.slot.owner)
            .field("pending", &self.is_pending())
            .finish()
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    slot: Rc<TimerSlot>,
}

// Reversed so that BinaryHeap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Entry>,
    pending: Vec<Entry>,
    next_seq: u64,
    counters: Rc<Counters>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: Vec::new(),
            next_seq: 0,
            counters: Rc::new(Counters::default()),
        }
    }

    /// Adds a timer to the pending list.
    pub(crate) fn schedule(
        &mut self,
        deadline: Instant,
        owner: Option<TaskId>,
        callback: Callback,
    ) -> TimerHandle {
        let slot = Rc::new(TimerSlot {
            deadline,
            owner,
            callback: RefCell::new(Some(callback)),
            canceled: Cell::new(false),
            called: Cell::new(false),
            counters: self.counters.clone(),
        });

        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.push(Entry {
            deadline,
            seq,
            slot: slot.clone(),
        });

        TimerHandle { slot }
    }

    /// Moves pending timers into the heap and compacts it if needed.
    pub(crate) fn prepare(&mut self) {
        for entry in self.pending.drain(..) {
            self.heap.push(entry);
        }

        let stored = self.heap.len();
        let canceled = self.counters.stored_canceled.get();
        if stored > COMPACT_MIN_LEN && canceled * 2 >= stored {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .filter(|entry| !entry.slot.canceled.get())
            .collect();
        self.counters.stored_canceled.set(0);
    }

    /// Pops the earliest live timer due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Rc<TimerSlot>> {
        loop {
            if self.heap.peek()?.deadline > now {
                return None;
            }

            let entry = self.heap.pop()?;
            if entry.slot.canceled.get() {
                self.forget_canceled();
                continue;
            }

            return Some(entry.slot);
        }
    }

    /// Earliest deadline among live timers in the heap and pending list.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if !top.slot.canceled.get() {
                break;
            }
            self.heap.pop();
            self.forget_canceled();
        }

        let pending = self
            .pending
            .iter()
            .filter(|entry| !entry.slot.canceled.get())
            .map(|entry| entry.deadline)
            .min();

        match (self.heap.peek().map(|entry| entry.deadline), pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn forget_canceled(&self) {
        let stored = self.counters.stored_canceled.get();
        self.counters.stored_canceled.set(stored.saturating_sub(1));
    }

    /// Number of live (not canceled) timers.
    pub(crate) fn len(&self) -> usize {
        (self.heap.len() + self.pending.len())
            .saturating_sub(self.counters.stored_canceled.get())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries physically stored, canceled ones included.
    #[cfg(test)]
    pub(crate) fn stored(&self) -> usize {
        self.heap.len() + self.pending.len()
    }

    pub(crate) fn total_canceled(&self) -> u64 {
        self.counters.total_canceled.get()
    }
}
