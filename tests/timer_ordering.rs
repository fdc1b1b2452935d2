use greenhub::{Runtime, get_hub, schedule_call_global, schedule_call_local, sleep, spawn};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut rt = Runtime::new();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let log = fired.clone();
    rt.block_on(async move {
        for delay in [25, 5, 15, 0, 10, 20] {
            let log = log.clone();
            schedule_call_global(ms(delay), move || log.borrow_mut().push(delay));
        }
        sleep(ms(50)).await;
    });

    assert_eq!(*fired.borrow(), vec![0, 5, 10, 15, 20, 25]);
}

#[test]
fn equal_deadlines_keep_insertion_order() {
    let mut rt = Runtime::new();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let log = fired.clone();
    rt.block_on(async move {
        let hub = get_hub();
        for label in ["a", "b", "c", "d"] {
            let log = log.clone();
            hub.schedule_call_global(Duration::ZERO, move || log.borrow_mut().push(label));
        }
        sleep(ms(5)).await;
    });

    assert_eq!(*fired.borrow(), vec!["a", "b", "c", "d"]);
}

#[test]
fn canceled_timer_never_fires_and_cancel_is_idempotent() {
    let mut rt = Runtime::new();
    let fired = Rc::new(Cell::new(0));

    let count = fired.clone();
    let stats = rt.block_on(async move {
        let hub = get_hub();
        let before = hub.stats().timers_canceled;

        let timer = schedule_call_global(ms(5), move || count.set(count.get() + 1));
        assert!(timer.is_pending());
        timer.cancel();
        timer.cancel();
        assert!(timer.is_canceled());

        sleep(ms(20)).await;
        hub.stats().timers_canceled - before
    });

    assert_eq!(fired.get(), 0);
    assert_eq!(stats, 1, "a second cancel must not be counted again");
}

#[test]
fn local_timer_is_void_once_its_task_exits() {
    let mut rt = Runtime::new();
    let local_fired = Rc::new(Cell::new(false));
    let global_fired = Rc::new(Cell::new(false));

    let local = local_fired.clone();
    let global = global_fired.clone();
    rt.block_on(async move {
        let child = spawn(async move {
            schedule_call_local(ms(5), move || local.set(true));
            schedule_call_global(ms(5), move || global.set(true));
        });
        child.await.unwrap();
        sleep(ms(20)).await;
    });

    assert!(!local_fired.get());
    assert!(global_fired.get());
}

#[test]
fn local_timer_fires_while_its_task_lives() {
    let mut rt = Runtime::new();
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    rt.block_on(async move {
        schedule_call_local(ms(5), move || flag.set(true));
        sleep(ms(20)).await;
    });

    assert!(fired.get());
}

#[test]
fn panicking_callback_does_not_stop_the_loop() {
    let mut rt = Runtime::new();
    let after = Rc::new(Cell::new(false));

    let flag = after.clone();
    let errors = rt.block_on(async move {
        let hub = get_hub();
        let before = hub.stats().callback_errors;

        schedule_call_global(ms(1), || panic!("callback failure"));
        schedule_call_global(ms(2), move || flag.set(true));
        sleep(ms(10)).await;

        hub.stats().callback_errors - before
    });

    assert_eq!(errors, 1);
    assert!(after.get());
}

#[test]
fn zero_sleep_takes_a_full_loop_turn() {
    let mut rt = Runtime::new();

    let order = rt.block_on(async {
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        schedule_call_global(Duration::ZERO, move || log.borrow_mut().push("timer"));
        sleep(Duration::ZERO).await;
        order.borrow_mut().push("task");

        order.take()
    });

    assert_eq!(order, vec!["timer", "task"]);
}

#[test]
fn run_returns_after_abort() {
    let hub = get_hub();
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    hub.schedule_call_global(ms(5), move || flag.set(true));
    let aborter = hub.clone();
    hub.schedule_call_global(ms(10), move || aborter.abort());

    hub.run().unwrap();

    assert!(fired.get());
    assert!(!hub.is_running());
}
