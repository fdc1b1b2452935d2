//! Task wake-ups.
//!
//! A [`Waker`] only records the id of the task to resume in a shared ready
//! list. The hub drains that list once per turn and schedules each task as a
//! zero-delay timer, so every resumption goes through the timer heap.
//!
//! Wakers are `Send`, so the ready list is guarded by a mutex and paired with
//! a pipe: a wake coming from another OS thread while the hub is blocked in
//! its backend writes one byte to the pipe to interrupt it.

use crate::task::TaskId;

use futures::task::{ArcWake, waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// Self-pipe used to interrupt a blocked backend.
struct WakePipe {
    read: RawFd,
    write: RawFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let pipe = WakePipe {
            read: fds[0],
            write: fds[1],
        };
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(pipe)
    }

    fn notify(&self) {
        // A full pipe already guarantees a wake-up.
        unsafe {
            libc::write(self.write, [1u8].as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Ids of woken tasks, shared between the hub and every waker it handed out.
pub(crate) struct ReadyQueue {
    ids: Mutex<VecDeque<TaskId>>,
    polling: AtomicBool,
    pipe: WakePipe,
}

impl ReadyQueue {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            ids: Mutex::new(VecDeque::new()),
            polling: AtomicBool::new(false),
            pipe: WakePipe::new()?,
        })
    }

    pub(crate) fn push(&self, id: TaskId) {
        self.ids.lock().push_back(id);

        if self.polling.load(Ordering::SeqCst) {
            self.pipe.notify();
        }
    }

    /// Takes every queued id, oldest first.
    pub(crate) fn drain(&self) -> Vec<TaskId> {
        self.ids.lock().drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Marks whether the hub is about to block (or has returned) in its backend.
    pub(crate) fn set_polling(&self, polling: bool) {
        self.polling.store(polling, Ordering::SeqCst);
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.pipe.read
    }

    pub(crate) fn clear_wakeups(&self) {
        self.pipe.drain();
    }
}

/// Waker that requeues one task on its hub.
struct TaskWaker {
    id: TaskId,
    queue: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.id);
    }
}

/// Creates a [`Waker`] that schedules task `id` on the hub owning `queue`.
///
/// # Arguments
/// * `id` - The task to resume when woken
/// * `queue` - The ready list of the hub running the task
pub(crate) fn make_waker(id: TaskId, queue: Arc<ReadyQueue>) -> Waker {
    waker(Arc::new(TaskWaker { id, queue }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_are_recorded_in_order() {
        let queue = Arc::new(ReadyQueue::new().unwrap());
        let a = TaskId::next();
        let b = TaskId::next();

        make_waker(a, queue.clone()).wake();
        make_waker(b, queue.clone()).wake_by_ref();
        assert_eq!(queue.drain(), vec![a, b]);
        assert!(queue.is_empty());
    }

    #[test]
    fn wake_from_another_thread_hits_the_pipe() {
        let queue = Arc::new(ReadyQueue::new().unwrap());
        let id = TaskId::next();
        let waker = make_waker(id, queue.clone());

        queue.set_polling(true);
        std::thread::spawn(move || waker.wake()).join().unwrap();

        let mut pfd = libc::pollfd {
            fd: queue.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 1000) }, 1);

        queue.clear_wakeups();
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 0);
        assert_eq!(queue.drain(), vec![id]);
    }
}
