use greenhub::time::sleep;
use greenhub::time::timeout;
use greenhub::{Error, RuntimeBuilder, spawn};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_timeout_completes_before_deadline() {
    let mut rt = RuntimeBuilder::new().build().unwrap();

    let result = rt.block_on(async {
        let handle = spawn(async {
            sleep(Duration::from_millis(10)).await;
            123
        });
        timeout(Duration::from_millis(200), handle).await
    });

    assert!(
        matches!(result, Ok(Ok(v)) if v == 123),
        "Timeout should return Ok(123)"
    );
}

#[test]
fn test_timeout_expires() {
    let mut rt = RuntimeBuilder::new().build().unwrap();

    let result = rt.block_on(async {
        let handle = spawn(async {
            sleep(Duration::from_millis(100)).await;
            456
        });
        timeout(Duration::from_millis(20), handle).await
    });

    assert!(
        matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(20)),
        "Timeout should return an error when deadline is exceeded"
    );
}

#[test]
fn test_timeout_drops_the_inner_future() {
    let mut rt = RuntimeBuilder::new().build().unwrap();
    let finished = Rc::new(Cell::new(false));

    let flag = finished.clone();
    rt.block_on(async move {
        let result = timeout(Duration::from_millis(5), async move {
            sleep(Duration::from_millis(50)).await;
            flag.set(true);
        })
        .await;
        assert!(result.is_err());

        sleep(Duration::from_millis(80)).await;
    });

    assert!(!finished.get(), "an expired future must not keep running");
}
