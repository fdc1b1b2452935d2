use super::{Interest, Poller, Readiness, interrupted, is_open};

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) struct SelectPoller;

impl SelectPoller {
    pub(crate) fn new() -> Self {
        SelectPoller
    }
}

fn empty_set() -> libc::fd_set {
    let mut set: libc::fd_set = unsafe { mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

impl Poller for SelectPoller {
    fn poll(
        &mut self,
        interests: &[(RawFd, Interest)],
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<()> {
        let mut readers = empty_set();
        let mut writers = empty_set();
        let mut errors = empty_set();
        let mut max_fd = -1;
        let mut watched = Vec::with_capacity(interests.len());

        for &(fd, interest) in interests {
            // select() cannot represent these; treat them like a dead fd.
            if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
                ready.push(Readiness::invalid(fd));
                continue;
            }

            unsafe {
                if interest.read {
                    libc::FD_SET(fd, &mut readers);
                }
                if interest.write {
                    libc::FD_SET(fd, &mut writers);
                }
                libc::FD_SET(fd, &mut errors);
            }

            max_fd = max_fd.max(fd);
            watched.push((fd, interest));
        }

        let wait = if ready.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        let mut tv = libc::timeval {
            tv_sec: wait.as_secs().min(i32::MAX as u64) as _,
            tv_usec: wait.subsec_micros() as _,
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut readers,
                &mut writers,
                &mut errors,
                &mut tv,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                return Ok(());
            }
            if err.raw_os_error() == Some(libc::EBADF) {
                // Find out which descriptor went away.
                for (fd, _) in watched {
                    if !is_open(fd) {
                        ready.push(Readiness::invalid(fd));
                    }
                }
                return Ok(());
            }
            return Err(err);
        }

        if n == 0 {
            return Ok(());
        }

        for (fd, interest) in watched {
            let (readable, writable, failed) = unsafe {
                (
                    libc::FD_ISSET(fd, &readers),
                    libc::FD_ISSET(fd, &writers),
                    libc::FD_ISSET(fd, &errors),
                )
            };

            let readable = readable || (failed && interest.read);
            let writable = writable || (failed && interest.write);
            if readable || writable {
                ready.push(Readiness {
                    fd,
                    readable,
                    writable,
                    invalid: false,
                });
            }
        }

        Ok(())
    }
}
