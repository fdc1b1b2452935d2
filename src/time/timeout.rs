//! Timeout combinator.
//!
//! [`timeout`] wraps any future with a deadline. If the inner future does not
//! complete in time, the wrapper resolves to [`Error::Timeout`] and the inner
//! future is dropped along with it.
//!
//! # Example
//!
//! ```ignore
//! use greenhub::time::{sleep, timeout};
//! use std::time::Duration;
//!
//! async fn run_with_timeout() {
//!     let result = timeout(Duration::from_millis(100), async {
//!         sleep(Duration::from_millis(10)).await;
//!         "done"
//!     })
//!     .await;
//!     assert_eq!(result.unwrap(), "done");
//! }
//! ```

use crate::error::{Error, Result};
use crate::hub::get_hub;
use crate::time::Alarm;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Runs `future` with a deadline of `duration` from its first poll.
///
/// # Arguments
/// * `duration` - How long the inner future may take
/// * `future` - The future to run
///
/// # Returns
/// A future resolving to `Ok(output)` or `Err(Error::Timeout(duration))`.
pub fn timeout<F>(duration: Duration, future: F) -> Timeout<F>
where
    F: Future,
{
    Timeout {
        future: Box::pin(future),
        duration,
        alarm: None,
    }
}

/// Future returned by [`timeout`].
pub struct Timeout<F> {
    future: Pin<Box<F>>,
    duration: Duration,
    alarm: Option<Alarm>,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Poll::Ready(output) = this.future.as_mut().poll(cx) {
            this.alarm = None;
            return Poll::Ready(Ok(output));
        }

        match &this.alarm {
            Some(alarm) if alarm.fired() => {
                this.alarm = None;
                Poll::Ready(Err(Error::Timeout(this.duration)))
            }
            Some(alarm) => {
                alarm.register(cx.waker());
                Poll::Pending
            }
            None => {
                this.alarm = Some(Alarm::new(&get_hub(), this.duration, cx.waker()));
                Poll::Pending
            }
        }
    }
}
