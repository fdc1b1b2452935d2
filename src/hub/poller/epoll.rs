use super::{Interest, Poller, Readiness, interrupted, timeout_millis};
use crate::error::Error;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLPRI, epoll_event,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

const READ_MASK: u32 = (EPOLLIN | EPOLLPRI) as u32;
const WRITE_MASK: u32 = EPOLLOUT as u32;
const ERROR_MASK: u32 = (EPOLLERR | EPOLLHUP) as u32;

pub(crate) struct EpollPoller {
    epfd: RawFd,
    registered: HashMap<RawFd, u32>,
    events: Vec<epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> Result<Self, Error> {
        let epfd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            epfd,
            registered: HashMap::new(),
            events: Vec::with_capacity(64),
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let event_ptr = if op == EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut event as *mut epoll_event
        };

        if unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Brings the kernel registration for `fd` in line with `mask`.
    fn sync(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        match self.registered.get(&fd) {
            Some(&current) if current == mask => return Ok(()),
            Some(_) => match self.ctl(EPOLL_CTL_MOD, fd, mask) {
                // The kernel forgot the fd (it was closed and reopened).
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                    self.ctl(EPOLL_CTL_ADD, fd, mask)?
                }
                other => other?,
            },
            None => match self.ctl(EPOLL_CTL_ADD, fd, mask) {
                Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                    self.ctl(EPOLL_CTL_MOD, fd, mask)?
                }
                other => other?,
            },
        }

        self.registered.insert(fd, mask);
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        interests: &[(RawFd, Interest)],
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<()> {
        let wanted: HashSet<RawFd> = interests.iter().map(|&(fd, _)| fd).collect();
        let stale: Vec<RawFd> = self
            .registered
            .keys()
            .filter(|fd| !wanted.contains(fd))
            .copied()
            .collect();
        for fd in stale {
            self.registered.remove(&fd);
            // Closed fds are dropped by the kernel on their own.
            let _ = self.ctl(EPOLL_CTL_DEL, fd, 0);
        }

        for &(fd, interest) in interests {
            let mut mask = 0;
            if interest.read {
                mask |= READ_MASK;
            }
            if interest.write {
                mask |= WRITE_MASK;
            }

            if self.sync(fd, mask).is_err() {
                self.registered.remove(&fd);
                ready.push(Readiness::invalid(fd));
            }
        }

        let capacity = interests.len().max(1);
        self.events.clear();
        self.events.reserve(capacity);

        let wait = if ready.is_empty() {
            timeout_millis(timeout)
        } else {
            0
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                capacity as i32,
                wait,
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

        for event in &self.events {
            // epoll_event is packed; copy fields out by value.
            let flags = event.events;
            let fd = event.u64 as RawFd;

            let failed = flags & ERROR_MASK != 0;
            ready.push(Readiness {
                fd,
                readable: failed || flags & READ_MASK != 0,
                writable: failed || flags & WRITE_MASK != 0,
                invalid: false,
            });
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
