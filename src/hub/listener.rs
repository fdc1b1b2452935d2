//! Per-fd interest registry.
//!
//! At most one reader and one writer are active per fd. When the hub allows
//! multiple readers, extra registrations are stacked as secondaries and the
//! oldest one is promoted when the active listener goes away.

use crate::error::Error;
use crate::hub::poller::Interest;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Direction of interest on a file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Identifies a registration made with [`crate::Hub::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Callback invoked with the fd that became ready (or was closed).
pub(crate) type FdCallback = Rc<dyn Fn(RawFd)>;

#[derive(Clone)]
pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
    pub(crate) cb: FdCallback,
    pub(crate) tb: FdCallback,
}

#[derive(Default)]
pub(crate) struct Listeners {
    readers: HashMap<RawFd, Listener>,
    writers: HashMap<RawFd, Listener>,
    secondaries: HashMap<(Direction, RawFd), VecDeque<Listener>>,
    index: HashMap<ListenerId, (Direction, RawFd)>,
    next_id: u64,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn primaries(&self, direction: Direction) -> &HashMap<RawFd, Listener> {
        match direction {
            Direction::Read => &self.readers,
            Direction::Write => &self.writers,
        }
    }

    fn primaries_mut(&mut self, direction: Direction) -> &mut HashMap<RawFd, Listener> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    pub(crate) fn add(
        &mut self,
        direction: Direction,
        fd: RawFd,
        cb: FdCallback,
        tb: FdCallback,
        allow_secondary: bool,
    ) -> Result<ListenerId, Error> {
        let occupied = self.primaries(direction).contains_key(&fd);
        if occupied && !allow_secondary {
            return Err(Error::DuplicateListener { fd, direction });
        }

        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let listener = Listener {
            id,
            fd,
            direction,
            cb,
            tb,
        };

        if occupied {
            self.secondaries
                .entry((direction, fd))
                .or_default()
                .push_back(listener);
        } else {
            self.primaries_mut(direction).insert(fd, listener);
        }

        self.index.insert(id, (direction, fd));
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<Listener> {
        let (direction, fd) = self.index.remove(&id)?;

        let is_primary = self
            .primaries(direction)
            .get(&fd)
            .is_some_and(|listener| listener.id == id);

        if is_primary {
            let removed = self.primaries_mut(direction).remove(&fd);
            if let Some(next) = self.pop_secondary(direction, fd) {
                self.primaries_mut(direction).insert(fd, next);
            }
            return removed;
        }

        let queue = self.secondaries.get_mut(&(direction, fd))?;
        let position = queue.iter().position(|listener| listener.id == id)?;
        let removed = queue.remove(position);
        if queue.is_empty() {
            self.secondaries.remove(&(direction, fd));
        }
        removed
    }

    fn pop_secondary(&mut self, direction: Direction, fd: RawFd) -> Option<Listener> {
        let queue = self.secondaries.get_mut(&(direction, fd))?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.secondaries.remove(&(direction, fd));
        }
        next
    }

    /// Removes every listener registered on `fd`, secondaries included.
    pub(crate) fn remove_descriptor(&mut self, fd: RawFd) -> Vec<Listener> {
        let mut removed = Vec::new();

        for direction in [Direction::Read, Direction::Write] {
            if let Some(listener) = self.primaries_mut(direction).remove(&fd) {
                removed.push(listener);
            }
            if let Some(queue) = self.secondaries.remove(&(direction, fd)) {
                removed.extend(queue);
            }
        }

        for listener in &removed {
            self.index.remove(&listener.id);
        }

        removed
    }

    /// Active listener for `fd` in `direction`.
    pub(crate) fn get(&self, direction: Direction, fd: RawFd) -> Option<Listener> {
        self.primaries(direction).get(&fd).cloned()
    }

    /// Combined interest per fd, sorted by fd so dispatch order is stable.
    pub(crate) fn interests(&self) -> Vec<(RawFd, Interest)> {
        let mut merged: BTreeMap<RawFd, Interest> = BTreeMap::new();

        for fd in self.readers.keys() {
            merged.entry(*fd).or_default().read = true;
        }
        for fd in self.writers.keys() {
            merged.entry(*fd).or_default().write = true;
        }

        merged.into_iter().collect()
    }

    pub(crate) fn readers(&self) -> usize {
        self.readers.len()
    }

    pub(crate) fn writers(&self) -> usize {
        self.writers.len()
    }

    pub(crate) fn secondaries(&self) -> usize {
        self.secondaries.values().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn noop() -> FdCallback {
        Rc::new(|_| {})
    }

    #[test]
    fn duplicate_reader_is_rejected() {
        let mut listeners = Listeners::new();
        listeners
            .add(Direction::Read, 5, noop(), noop(), false)
            .unwrap();

        let err = listeners
            .add(Direction::Read, 5, noop(), noop(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateListener {
                fd: 5,
                direction: Direction::Read
            }
        ));

        // The other direction is independent.
        listeners
            .add(Direction::Write, 5, noop(), noop(), false)
            .unwrap();
        assert_eq!(
            listeners.interests(),
            vec![(
                5,
                Interest {
                    read: true,
                    write: true
                }
            )]
        );
    }

    #[test]
    fn secondary_is_promoted_on_removal() {
        let mut listeners = Listeners::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let first_hits = hits.clone();
        let first = listeners
            .add(
                Direction::Read,
                7,
                Rc::new(move |_| first_hits.borrow_mut().push("first")),
                noop(),
                true,
            )
            .unwrap();

        let second_hits = hits.clone();
        listeners
            .add(
                Direction::Read,
                7,
                Rc::new(move |_| second_hits.borrow_mut().push("second")),
                noop(),
                true,
            )
            .unwrap();
        assert_eq!(listeners.secondaries(), 1);

        listeners.remove(first).unwrap();
        assert_eq!(listeners.secondaries(), 0);

        let active = listeners.get(Direction::Read, 7).unwrap();
        (active.cb)(7);
        assert_eq!(*hits.borrow(), vec!["second"]);
    }

    #[test]
    fn remove_descriptor_takes_everything() {
        let mut listeners = Listeners::new();
        listeners
            .add(Direction::Read, 3, noop(), noop(), true)
            .unwrap();
        listeners
            .add(Direction::Read, 3, noop(), noop(), true)
            .unwrap();
        listeners
            .add(Direction::Write, 3, noop(), noop(), true)
            .unwrap();
        listeners
            .add(Direction::Read, 4, noop(), noop(), true)
            .unwrap();

        let removed = listeners.remove_descriptor(3);
        assert_eq!(removed.len(), 3);
        assert_eq!(listeners.readers(), 1);
        assert_eq!(listeners.writers(), 0);
        assert!(!listeners.is_empty());
    }

    #[test]
    fn removing_twice_returns_none() {
        let mut listeners = Listeners::new();
        let id = listeners
            .add(Direction::Write, 9, noop(), noop(), false)
            .unwrap();

        assert!(listeners.remove(id).is_some());
        assert!(listeners.remove(id).is_none());
        assert!(listeners.is_empty());
    }
}
