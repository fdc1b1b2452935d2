use greenhub::{Event, Runtime, TaskError, sleep, spawn, yield_now};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn kill_before_start_never_runs_the_task() {
    let mut rt = Runtime::new();
    let ran = Rc::new(Cell::new(false));
    let ran_clone = ran.clone();

    let result = rt.block_on(async move {
        let handle = spawn(async move {
            ran_clone.set(true);
        });
        handle.kill();
        assert!(handle.is_finished(), "an unstarted task is finished on the spot");
        handle.await
    });

    assert_eq!(result, Err(TaskError::Killed));
    assert!(!ran.get());
}

#[test]
fn kill_suspended_task_runs_its_destructors() {
    let mut rt = Runtime::new();
    let cleaned_up = Rc::new(Cell::new(false));
    let reached_end = Rc::new(Cell::new(false));

    let guard_flag = cleaned_up.clone();
    let end_flag = reached_end.clone();
    let result = rt.block_on(async move {
        let handle = spawn(async move {
            let _guard = SetOnDrop(guard_flag);
            sleep(Duration::from_secs(10)).await;
            end_flag.set(true);
        });

        yield_now().await;
        assert!(!handle.is_finished());

        handle.kill();
        handle.await
    });

    assert_eq!(result, Err(TaskError::Killed));
    assert!(cleaned_up.get(), "the killed task's future must be dropped");
    assert!(!reached_end.get());
}

#[test]
fn kill_waiting_task_releases_event_waiter() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let event = Event::<u32>::new();
        let waiter = event.clone();

        let handle = spawn(async move { waiter.wait().await });
        yield_now().await;

        handle.kill();
        assert_eq!(handle.await, Err(TaskError::Killed));

        // Nobody is left waiting; sending still works.
        event.send(1).unwrap();
    });
}

#[test]
fn task_killing_itself_finishes_its_current_poll() {
    let mut rt = Runtime::new();
    let after_kill = Rc::new(Cell::new(false));
    let after_suspend = Rc::new(Cell::new(false));

    let a = after_kill.clone();
    let b = after_suspend.clone();
    let result = rt.block_on(async move {
        let slot: Rc<Cell<Option<greenhub::JoinHandle<()>>>> = Rc::new(Cell::new(None));
        let own = slot.clone();

        let handle = spawn(async move {
            yield_now().await;
            if let Some(me) = own.take() {
                me.kill();
            }
            a.set(true);
            yield_now().await;
            b.set(true);
        });

        slot.set(Some(handle));
        sleep(Duration::from_millis(10)).await;
        "done"
    });

    assert_eq!(result, "done");
    assert!(after_kill.get(), "code up to the next suspension point still runs");
    assert!(!after_suspend.get());
}

#[test]
fn cancel_only_works_before_start() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let early = spawn(async { 1 });
        assert!(early.cancel());
        assert_eq!(early.await, Err(TaskError::Killed));

        let late = spawn(async {
            sleep(Duration::from_millis(5)).await;
            2
        });
        yield_now().await;
        assert!(!late.cancel());
        assert_eq!(late.await, Ok(2));
    });
}

#[test]
fn kill_after_finish_keeps_the_result() {
    let mut rt = Runtime::new();

    let result = rt.block_on(async {
        let handle = spawn(async { 5 });
        sleep(Duration::from_millis(1)).await;
        assert!(handle.is_finished());
        handle.kill();
        handle.await
    });

    assert_eq!(result, Ok(5));
}
