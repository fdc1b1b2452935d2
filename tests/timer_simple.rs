use greenhub::{Runtime, sleep, spawn, yield_now};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn test_sleep_basic() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        sleep(Duration::from_millis(50)).await;
    });
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(50),
        "Sleep should wait at least the specified duration"
    );
}

#[test]
fn test_sleep_zero_duration() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        sleep(Duration::from_millis(0)).await;
    });
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(100),
        "Zero duration sleep should be fast"
    );
}

#[test]
fn test_sleep_in_function() {
    let mut rt = Runtime::new();
    let start = Instant::now();

    rt.block_on(async move {
        sleep_and_record(start).await;
    });
}

async fn sleep_and_record(start: Instant) {
    let elapsed_before = start.elapsed();
    sleep(Duration::from_millis(30)).await;
    let elapsed_after = start.elapsed();

    assert!(elapsed_after - elapsed_before >= Duration::from_millis(30));
}

#[test]
fn test_concurrent_sleeps_overlap() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        let handles: Vec<_> = (0..5)
            .map(|_| spawn(async { sleep(Duration::from_millis(40)).await }))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    });

    assert!(
        start.elapsed() < Duration::from_millis(180),
        "Sleeping tasks should run concurrently"
    );
}

#[test]
fn test_yield_now_interleaves_tasks() {
    let mut rt = Runtime::new();
    let trace = Rc::new(RefCell::new(Vec::new()));

    let t = trace.clone();
    rt.block_on(async move {
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let t = t.clone();
            handles.push(spawn(async move {
                for step in 0..3 {
                    t.borrow_mut().push(format!("{name}{step}"));
                    yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    });

    assert_eq!(
        *trace.borrow(),
        vec!["a0", "b0", "a1", "b1", "a2", "b2"],
        "yield_now should let the other task run"
    );
}

#[test]
#[should_panic(expected = "sleep() called outside of a task")]
fn test_sleep_outside_task_panics() {
    let _ = futures::executor::block_on(sleep(Duration::from_millis(1)));
}
