use crate::hub::get_hub;
use crate::runtime::context::current_task;
use crate::time::Alarm;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Suspends the calling task for `duration`.
///
/// The first poll always suspends, even for a zero duration, and the task
/// resumes no earlier than the next loop turn. This is what lets
/// `sleep(Duration::ZERO)` act as a cooperative yield.
///
/// # Panics
/// The returned future panics if it is polled outside of a task.
///
/// # Example
/// ```ignore
/// sleep(Duration::from_millis(5)).await;
/// ```
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        alarm: None,
    }
}

/// Future returned by [`sleep`].
pub struct Sleep {
    duration: Duration,
    alarm: Option<Alarm>,
}

impl Sleep {
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(alarm) = &self.alarm {
            if alarm.fired() {
                return Poll::Ready(());
            }
            alarm.register(cx.waker());
            return Poll::Pending;
        }

        if current_task().is_none() {
            panic!("sleep() called outside of a task");
        }

        let alarm = Alarm::new(&get_hub(), self.duration, cx.waker());
        self.alarm = Some(alarm);
        Poll::Pending
    }
}
