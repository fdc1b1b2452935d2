use super::{Interest, Poller, Readiness, interrupted};
use crate::error::Error;

use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

pub(crate) struct KqueuePoller {
    kqueue: RawFd,
    registered: HashMap<RawFd, Interest>,
    events: Vec<kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    let mut event: kevent = unsafe { mem::zeroed() };
    event.ident = fd as usize;
    event.filter = filter as _;
    event.flags = flags as _;
    event
}

impl KqueuePoller {
    pub(crate) fn new() -> Result<Self, Error> {
        let kqueue = unsafe { libc::kqueue() };
        if kqueue < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(KqueuePoller {
            kqueue,
            registered: HashMap::new(),
            events: Vec::with_capacity(64),
        })
    }

    fn apply(&self, changes: &[kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let ret = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn sync(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let current = self.registered.get(&fd).copied().unwrap_or_default();
        if current == interest {
            return Ok(());
        }

        let mut changes = Vec::with_capacity(2);
        for (filter, was, now) in [
            (EVFILT_READ, current.read, interest.read),
            (EVFILT_WRITE, current.write, interest.write),
        ] {
            match (was, now) {
                (false, true) => changes.push(change(fd, filter as i16, (EV_ADD | EV_ENABLE) as u16)),
                (true, false) => changes.push(change(fd, filter as i16, EV_DELETE as u16)),
                _ => {}
            }
        }

        self.apply(&changes)?;
        self.registered.insert(fd, interest);
        Ok(())
    }
}

impl Poller for KqueuePoller {
    fn poll(
        &mut self,
        interests: &[(RawFd, Interest)],
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<()> {
        let wanted: HashMap<RawFd, Interest> = interests.iter().copied().collect();

        let stale: Vec<RawFd> = self
            .registered
            .keys()
            .filter(|fd| !wanted.contains_key(fd))
            .copied()
            .collect();
        for fd in stale {
            // Deleting filters of a closed fd fails; the kernel already dropped them.
            let _ = self.sync(fd, Interest::default());
            self.registered.remove(&fd);
        }

        for &(fd, interest) in interests {
            if self.sync(fd, interest).is_err() {
                self.registered.remove(&fd);
                ready.push(Readiness::invalid(fd));
            }
        }

        let capacity = (interests.len() * 2).max(1);
        self.events.clear();
        self.events.reserve(capacity);

        let wait = if ready.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        let ts = libc::timespec {
            tv_sec: wait.as_secs().min(i32::MAX as u64) as _,
            tv_nsec: wait.subsec_nanos() as _,
        };

        let n = unsafe {
            kevent(
                self.kqueue,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                capacity as i32,
                &ts,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                return Ok(());
            }
            return Err(err);
        }

        unsafe { self.events.set_len(n as usize) };

        // Read and write filters come back as separate events; merge per fd.
        let mut merged: BTreeMap<RawFd, Readiness> = BTreeMap::new();
        for event in &self.events {
            let fd = event.ident as RawFd;
            let entry = merged.entry(fd).or_insert(Readiness {
                fd,
                readable: false,
                writable: false,
                invalid: false,
            });

            let flags = event.flags as u16;
            if flags & EV_ERROR as u16 != 0 {
                if event.data as i32 == libc::EBADF {
                    entry.invalid = true;
                } else {
                    entry.readable = true;
                    entry.writable = true;
                }
                continue;
            }

            let eof = flags & EV_EOF as u16 != 0;
            if event.filter == EVFILT_READ as _ {
                entry.readable = true;
            } else if event.filter == EVFILT_WRITE as _ {
                entry.writable = true;
            }
            if eof {
                let want = wanted.get(&fd).copied().unwrap_or_default();
                entry.readable |= want.read;
                entry.writable |= want.write;
            }
        }

        ready.extend(merged.into_values());
        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kqueue);
        }
    }
}
