use futures::FutureExt;
use greenhub::{Error, Event, Runtime, sleep, spawn, yield_now};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn send_wakes_every_waiter() {
    let mut rt = Runtime::new();

    let results = rt.block_on(async {
        let event = Event::<&str>::new();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let event = event.clone();
                spawn(async move { event.wait().await })
            })
            .collect();
        yield_now().await;

        event.send("go").unwrap();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results
    });

    assert_eq!(results, vec!["go"; 3]);
}

#[test]
fn sender_keeps_running_after_send() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let event = Event::<u32>::new();
        let woken = Rc::new(Cell::new(false));

        let waiter = event.clone();
        let flag = woken.clone();
        let handle = spawn(async move {
            let value = waiter.wait().await;
            flag.set(true);
            value
        });
        yield_now().await;

        event.send(7).unwrap();
        assert!(!woken.get(), "send must not switch to the waiter");

        assert!(matches!(handle.await, Ok(Ok(7))));
        assert!(woken.get());
    });
}

#[test]
fn wait_after_send_returns_without_suspending() {
    let event = Event::<u32>::new();
    event.send(5).unwrap();

    assert!(matches!(event.wait().now_or_never(), Some(Ok(5))));
    assert!(matches!(event.try_get(), Some(Ok(5))));
}

#[test]
fn second_send_is_rejected_until_reset() {
    let event = Event::<u32>::new();

    assert!(matches!(event.reset(), Err(Error::NotSent)));

    event.send(1).unwrap();
    assert!(matches!(event.send(2), Err(Error::AlreadySent)));
    assert!(matches!(event.send_exception(Error::Empty), Err(Error::AlreadySent)));

    event.reset().unwrap();
    assert!(!event.ready());
    event.send(3).unwrap();
    assert!(matches!(event.try_get(), Some(Ok(3))));
}

#[test]
fn exception_is_delivered_to_waiters() {
    let mut rt = Runtime::new();

    let result = rt.block_on(async {
        let event = Event::<u32>::new();
        let waiter = event.clone();
        let handle = spawn(async move { waiter.wait().await });
        yield_now().await;

        event.send_exception(Error::Full).unwrap();
        assert!(event.has_exception());
        assert!(!event.has_value());

        handle.await.unwrap()
    });

    assert!(matches!(result, Err(Error::Full)));
}

#[test]
fn wait_timeout_gives_up() {
    let mut rt = Runtime::new();

    let (missed, hit) = rt.block_on(async {
        let event = Event::<u32>::new();
        let missed = event.wait_timeout(Duration::from_millis(10)).await;

        let sender = event.clone();
        spawn(async move {
            sleep(Duration::from_millis(5)).await;
            sender.send(9).unwrap();
        });
        let hit = event.wait_timeout(Duration::from_secs(1)).await;

        (missed, hit)
    });

    assert!(missed.is_none());
    assert!(matches!(hit, Some(Ok(9))));
}
