use greenhub::{Error, Runtime, Semaphore, sleep, spawn, yield_now};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[test]
fn second_acquirer_waits_for_release() {
    let mut rt = Runtime::new();

    let log = rt.block_on(async {
        let semaphore = Semaphore::new(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let first_can_release = Rc::new(Cell::new(false));

        let sem = semaphore.clone();
        let first_log = log.clone();
        let release_flag = first_can_release.clone();
        let first = spawn(async move {
            sem.acquire().await;
            first_log.borrow_mut().push("first acquired");
            while !release_flag.get() {
                yield_now().await;
            }
            first_log.borrow_mut().push("first released");
            sem.release().unwrap();
        });

        let sem = semaphore.clone();
        let second_log = log.clone();
        let second = spawn(async move {
            sem.acquire().await;
            second_log.borrow_mut().push("second acquired");
        });

        sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.borrow(), vec!["first acquired"]);
        assert_eq!(semaphore.waiting(), 1);
        assert!(semaphore.locked());

        first_can_release.set(true);
        first.await.unwrap();
        second.await.unwrap();

        log.take()
    });

    assert_eq!(
        log,
        vec!["first acquired", "first released", "second acquired"]
    );
}

#[test]
fn release_wakes_exactly_one_waiter() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let semaphore = Semaphore::new(0);
        let acquired = Rc::new(Cell::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sem = semaphore.clone();
                let count = acquired.clone();
                spawn(async move {
                    sem.acquire().await;
                    count.set(count.get() + 1);
                })
            })
            .collect();
        yield_now().await;
        assert_eq!(semaphore.balance(), -2);

        semaphore.release().unwrap();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(acquired.get(), 1, "one release lets one task through");
        assert_eq!(semaphore.waiting(), 1);

        semaphore.release().unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(acquired.get(), 2);
    });
}

#[test]
fn try_acquire_and_counters() {
    let semaphore = Semaphore::new(2);

    assert!(semaphore.try_acquire());
    assert!(semaphore.try_acquire());
    assert!(!semaphore.try_acquire());
    assert!(semaphore.locked());
    assert_eq!(semaphore.available(), 0);
    assert_eq!(semaphore.capacity(), 2);
}

#[test]
fn bounded_semaphore_rejects_extra_release() {
    let semaphore = Semaphore::bounded(1);
    assert!(matches!(semaphore.release(), Err(Error::ReleasedTooManyTimes)));

    let unbounded = Semaphore::new(1);
    unbounded.release().unwrap();
    assert_eq!(unbounded.available(), 2);
}

#[test]
fn acquire_timeout_gives_up() {
    let mut rt = Runtime::new();

    let (result, waiting) = rt.block_on(async {
        let semaphore = Semaphore::new(0);
        let result = semaphore.acquire_timeout(Duration::from_millis(10)).await;
        (result, semaphore.waiting())
    });

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(waiting, 0, "a timed out acquirer must leave the queue");
}

#[test]
fn access_guard_releases_on_drop() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let semaphore = Semaphore::bounded(1);
        {
            let _guard = semaphore.access().await;
            assert!(semaphore.locked());
        }
        assert!(!semaphore.locked());
        assert_eq!(semaphore.available(), 1);
    });
}

#[test]
fn shrinking_resize_keeps_holders() {
    let semaphore = Semaphore::new(2);
    assert!(semaphore.try_acquire());
    assert!(semaphore.try_acquire());

    semaphore.resize(1);
    assert_eq!(semaphore.capacity(), 1);
    assert_eq!(semaphore.available(), -1);

    semaphore.release().unwrap();
    assert!(semaphore.locked());
    semaphore.release().unwrap();
    assert!(!semaphore.locked());
}
