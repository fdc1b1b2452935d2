//! Readiness multiplexing backends.
//!
//! Each backend receives the full interest set on every call and reports
//! which fds are ready. Backends that keep kernel-side registrations
//! (`epoll`, `kqueue`) diff the set against what they registered last time.

mod poll;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod kqueue;

use crate::config::Backend;
use crate::error::{ConfigError, Error};

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Read/write interest for one fd.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };
}

/// One fd reported by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// The fd is not open (closed behind the hub's back).
    pub(crate) invalid: bool,
}

impl Readiness {
    pub(crate) fn invalid(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: false,
            invalid: true,
        }
    }
}

pub(crate) trait Poller {
    /// Blocks for at most `timeout` and appends ready fds to `ready`.
    fn poll(
        &mut self,
        interests: &[(RawFd, Interest)],
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<()>;
}

pub(crate) fn new_poller(backend: Backend) -> Result<Box<dyn Poller>, Error> {
    match backend {
        Backend::Select => Ok(Box::new(select::SelectPoller::new())),
        Backend::Poll => Ok(Box::new(poll::PollPoller::new())),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Backend::Epoll => Ok(Box::new(epoll::EpollPoller::new()?)),
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        Backend::Kqueue => Ok(Box::new(kqueue::KqueuePoller::new()?)),
        other => Err(ConfigError::UnsupportedBackend(other.name().to_string()).into()),
    }
}

/// Timeout in whole milliseconds, rounded up so the loop never spins early.
pub(crate) fn timeout_millis(timeout: Duration) -> i32 {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(i32::MAX as u128) as i32
}

/// True if `fd` refers to an open descriptor.
pub(crate) fn is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::from_millis(50)), 50);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), i32::MAX);
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn check_backend(backend: Backend) {
        let mut poller = new_poller(backend).unwrap();
        let (rfd, wfd) = pipe();
        let mut ready = Vec::new();

        poller
            .poll(&[(rfd, Interest::READ)], Duration::ZERO, &mut ready)
            .unwrap();
        assert!(ready.iter().all(|r| !r.readable), "{backend}: nothing written yet");

        assert_eq!(unsafe { libc::write(wfd, b"x".as_ptr() as *const _, 1) }, 1);
        ready.clear();
        poller
            .poll(
                &[(rfd, Interest::READ)],
                Duration::from_millis(500),
                &mut ready,
            )
            .unwrap();
        assert!(
            ready.iter().any(|r| r.fd == rfd && r.readable),
            "{backend}: pipe should be readable"
        );

        ready.clear();
        poller
            .poll(
                &[(
                    wfd,
                    Interest {
                        read: false,
                        write: true,
                    },
                )],
                Duration::from_millis(500),
                &mut ready,
            )
            .unwrap();
        assert!(ready.iter().any(|r| r.fd == wfd && r.writable));

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn select_reports_readiness() {
        check_backend(Backend::Select);
    }

    #[test]
    fn poll_reports_readiness() {
        check_backend(Backend::Poll);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn epoll_reports_readiness() {
        check_backend(Backend::Epoll);
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    #[test]
    fn kqueue_reports_readiness() {
        check_backend(Backend::Kqueue);
    }

    // Far above anything the test harness opens, and below FD_SETSIZE.
    const UNUSED_FD: RawFd = 917;

    fn check_closed_descriptor(backend: Backend) {
        assert!(!is_open(UNUSED_FD));
        let mut poller = new_poller(backend).unwrap();

        let mut ready = Vec::new();
        poller
            .poll(&[(UNUSED_FD, Interest::READ)], Duration::ZERO, &mut ready)
            .unwrap();
        assert_eq!(ready, vec![Readiness::invalid(UNUSED_FD)]);
    }

    #[test]
    fn poll_flags_closed_descriptors() {
        check_closed_descriptor(Backend::Poll);
    }

    #[test]
    fn select_flags_closed_descriptors() {
        check_closed_descriptor(Backend::Select);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn epoll_flags_closed_descriptors() {
        check_closed_descriptor(Backend::Epoll);
    }
}
