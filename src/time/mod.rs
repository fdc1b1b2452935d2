//! Time utilities: cooperative sleep and timeouts.
//!
//! - [`sleep`] suspends the calling task; `sleep(Duration::ZERO)` is the
//!   canonical way to let every other ready task run once.
//! - [`timeout`] races any future against a deadline.
//!
//! # Example: Sleep
//!
//! ```ignore
//! use greenhub::time::sleep;
//! use std::time::Duration;
//!
//! async fn wait() {
//!     sleep(Duration::from_millis(10)).await;
//! }
//! ```
//!
//! # Example: Timeout
//!
//! ```ignore
//! use greenhub::time::{sleep, timeout};
//! use greenhub::Error;
//! use std::time::Duration;
//!
//! async fn too_slow() {
//!     let result = timeout(Duration::from_millis(10), async {
//!         sleep(Duration::from_millis(100)).await;
//!     })
//!     .await;
//!     assert!(matches!(result, Err(Error::Timeout(_))));
//! }
//! ```

pub mod sleep;
pub mod timeout;

pub use sleep::{Sleep, sleep};
pub use timeout::{Timeout, timeout};

use crate::hub::{Hub, TimerHandle};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::task::Waker;
use std::time::{Duration, Instant};

#[derive(Default)]
struct AlarmState {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// A global timer that wakes one task when it fires.
///
/// Dropping the alarm cancels the timer.
pub(crate) struct Alarm {
    timer: TimerHandle,
    state: Rc<AlarmState>,
}

impl Alarm {
    pub(crate) fn new(hub: &Hub, delay: Duration, waker: &Waker) -> Self {
        let state = Rc::new(AlarmState::default());
        *state.waker.borrow_mut() = Some(waker.clone());

        let shared = state.clone();
        let timer = hub.schedule_at(
            Instant::now() + delay,
            None,
            Box::new(move || {
                shared.fired.set(true);
                if let Some(waker) = shared.waker.borrow_mut().take() {
                    waker.wake();
                }
            }),
        );

        Alarm { timer, state }
    }

    pub(crate) fn fired(&self) -> bool {
        self.state.fired.get()
    }

    /// Replaces the waker to notify.
    pub(crate) fn register(&self, waker: &Waker) {
        *self.state.waker.borrow_mut() = Some(waker.clone());
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
