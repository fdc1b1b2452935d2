use greenhub::{
    Backend, Direction, Error, RuntimeBuilder, get_hub, sleep, spawn, timeout, trampoline,
    yield_now,
};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let buf = [1u8; 1];
    let wrote = unsafe { libc::write(fd, buf.as_ptr() as *const _, 1) };
    assert_eq!(wrote, 1);
}

fn close(fds: &[RawFd]) {
    for &fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

fn available_backends() -> Vec<Backend> {
    [Backend::Select, Backend::Poll, Backend::Epoll, Backend::Kqueue]
        .into_iter()
        .filter(|backend| backend.is_available())
        .collect()
}

#[test]
fn read_readiness_wakes_the_waiter_on_every_backend() {
    for backend in available_backends() {
        let mut rt = RuntimeBuilder::new().backend(backend).build().unwrap();
        let (rfd, wfd) = pipe();

        let (result, elapsed) = rt.block_on(async move {
            let start = Instant::now();
            spawn(async move {
                sleep(Duration::from_millis(50)).await;
                write_byte(wfd);
            });

            let result = trampoline(rfd, Direction::Read, Some(Duration::from_secs(2))).await;
            (result, start.elapsed())
        });

        assert!(
            matches!(result, Ok(fd) if fd == rfd),
            "{backend}: expected readiness, got {result:?}"
        );
        assert!(elapsed >= Duration::from_millis(45), "{backend}: woke too early");
        assert!(elapsed < Duration::from_secs(1), "{backend}: woke too late");
        assert_eq!(rt.hub().stats().readers, 0, "{backend}: listener left behind");

        close(&[rfd, wfd]);
    }
}

#[test]
fn write_end_is_ready_immediately() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let (rfd, wfd) = pipe();

    let result = rt.block_on(async move {
        trampoline(wfd, Direction::Write, Some(Duration::from_secs(1))).await
    });

    assert!(matches!(result, Ok(fd) if fd == wfd));
    close(&[rfd, wfd]);
}

#[test]
fn trampoline_times_out() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let (rfd, wfd) = pipe();

    let (plain, custom) = rt.block_on(async move {
        let plain = trampoline(rfd, Direction::Read, Some(Duration::from_millis(20))).await;
        let custom = trampoline(rfd, Direction::Read, Some(Duration::from_millis(5)))
            .timeout_error(Error::Empty)
            .await;
        (plain, custom)
    });

    assert!(matches!(plain, Err(Error::Timeout(d)) if d == Duration::from_millis(20)));
    assert!(matches!(custom, Err(Error::Empty)));
    assert_eq!(rt.hub().stats().readers, 0);
    close(&[rfd, wfd]);
}

#[test]
fn second_reader_is_rejected_by_default() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let (rfd, wfd) = pipe();

    let (second, first) = rt.block_on(async move {
        let first = spawn(async move { trampoline(rfd, Direction::Read, None).await });
        yield_now().await;

        let second = trampoline(rfd, Direction::Read, None).await;

        write_byte(wfd);
        (second, first.await.unwrap())
    });

    assert!(matches!(
        second,
        Err(Error::DuplicateListener { fd, direction: Direction::Read }) if fd == rfd
    ));
    assert!(matches!(first, Ok(fd) if fd == rfd));
    close(&[rfd, wfd]);
}

#[test]
fn stacked_readers_are_served_in_turn() {
    let mut rt = RuntimeBuilder::new()
        .prevent_multiple_readers(false)
        .build()
        .unwrap();
    let (rfd, wfd) = pipe();

    let (a, b, secondaries) = rt.block_on(async move {
        let a = spawn(async move { trampoline(rfd, Direction::Read, None).await });
        let b = spawn(async move { trampoline(rfd, Direction::Read, None).await });
        yield_now().await;

        let secondaries = get_hub().stats().secondaries;
        write_byte(wfd);
        (a.await.unwrap(), b.await.unwrap(), secondaries)
    });

    assert_eq!(secondaries, 1);
    assert!(matches!(a, Ok(fd) if fd == rfd));
    assert!(matches!(b, Ok(fd) if fd == rfd));
    close(&[rfd, wfd]);
}

#[test]
fn notify_close_wakes_the_waiter_on_every_backend() {
    for backend in available_backends() {
        let mut rt = RuntimeBuilder::new().backend(backend).build().unwrap();
        let (rfd, wfd) = pipe();

        let result = rt.block_on(async move {
            let waiter =
                spawn(async move { trampoline(rfd, Direction::Read, Some(Duration::from_secs(2))).await });
            sleep(Duration::from_millis(10)).await;

            get_hub().notify_close(rfd);
            waiter.await.unwrap()
        });

        assert!(
            matches!(result, Err(Error::Closed(fd)) if fd == rfd),
            "{backend}: expected a closed error, got {result:?}"
        );
        close(&[rfd, wfd]);
    }
}

#[test]
fn trampoline_outside_a_task_is_rejected() {
    let (rfd, wfd) = pipe();

    let result = futures::executor::block_on(trampoline(rfd, Direction::Read, None));

    assert!(matches!(result, Err(Error::BlockingInHub)));
    close(&[rfd, wfd]);
}

#[test]
fn dropped_trampoline_removes_its_listener() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let (rfd, wfd) = pipe();

    let (result, readers) = rt.block_on(async move {
        let result = timeout(
            Duration::from_millis(10),
            trampoline(rfd, Direction::Read, None),
        )
        .await;
        (result, get_hub().stats().readers)
    });

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(readers, 0);
    close(&[rfd, wfd]);
}

#[test]
fn raw_listener_callbacks_and_removal() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let (rfd, wfd) = pipe();
    let calls = Rc::new(Cell::new(0));

    let count = calls.clone();
    let (removed, removed_again, dropped) = rt.block_on(async move {
        let hub = get_hub();
        let id = hub
            .add(
                Direction::Read,
                rfd,
                move |_| count.set(count.get() + 1),
                |_| {},
            )
            .unwrap();

        write_byte(wfd);
        sleep(Duration::from_millis(10)).await;

        let removed = hub.remove(id);
        let removed_again = hub.remove(id);

        hub.add(Direction::Read, rfd, |_| {}, |_| {}).unwrap();
        hub.add(Direction::Write, wfd, |_| {}, |_| {}).unwrap();
        let dropped = hub.remove_descriptor(rfd) + hub.remove_descriptor(wfd);

        (removed, removed_again, dropped)
    });

    assert!(calls.get() >= 1, "read callback should have fired");
    assert!(removed);
    assert!(!removed_again);
    assert_eq!(dropped, 2);
    close(&[rfd, wfd]);
}
