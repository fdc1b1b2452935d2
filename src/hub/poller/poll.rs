use super::{Interest, Poller, Readiness, interrupted, timeout_millis};

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, pollfd};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_MASK: i16 = POLLIN | POLLPRI;
const WRITE_MASK: i16 = POLLOUT;
const ERROR_MASK: i16 = POLLERR | POLLHUP;

pub(crate) struct PollPoller {
    fds: Vec<pollfd>,
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        Self {
            fds: Vec::with_capacity(64),
        }
    }
}

impl Poller for PollPoller {
    fn poll(
        &mut self,
        interests: &[(RawFd, Interest)],
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<()> {
        self.fds.clear();
        self.fds.extend(interests.iter().map(|&(fd, interest)| {
            let mut events = 0;
            if interest.read {
                events |= READ_MASK;
            }
            if interest.write {
                events |= WRITE_MASK;
            }
            pollfd {
                fd,
                events,
                revents: 0,
            }
        }));

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                return Ok(());
            }
            return Err(err);
        }

        for entry in self.fds.iter().filter(|entry| entry.revents != 0) {
            let revents = entry.revents;

            if revents & POLLNVAL != 0 {
                ready.push(Readiness::invalid(entry.fd));
                continue;
            }

            // Errors and hangups wake both directions.
            let failed = revents & ERROR_MASK != 0;
            ready.push(Readiness {
                fd: entry.fd,
                readable: failed || revents & READ_MASK != 0,
                writable: failed || revents & WRITE_MASK != 0,
                invalid: false,
            });
        }

        Ok(())
    }
}
