//! Entry point that drives a hub until a main future completes.
//!
//! The runtime owns a handle to a hub. `block_on` spawns the main future as a
//! task on that hub, installs the hub as the thread's hub for free functions
//! such as [`crate::spawn`] and [`crate::sleep`], and runs the loop until the
//! main task finishes.

use crate::error::TaskError;
use crate::hub::{Exit, Hub, get_hub};
use crate::runtime::context::enter_hub;
use crate::task::JoinHandle;

use std::future::Future;

/// Main entry point for running futures on a hub.
///
/// # Example
/// ```ignore
/// let mut rt = Runtime::new();
/// let value = rt.block_on(async { 42 });
/// assert_eq!(value, 42);
/// ```
pub struct Runtime {
    hub: Hub,
}

impl Runtime {
    /// Creates a runtime on the current thread's hub.
    ///
    /// # Example
    /// ```ignore
    /// let rt = Runtime::new();
    /// ```
    pub fn new() -> Self {
        Self { hub: get_hub() }
    }

    /// Creates a runtime driving an explicit hub.
    pub fn with_hub(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Spawns a background task on the runtime's hub.
    ///
    /// The task starts once the hub runs, typically inside the next
    /// `block_on`.
    ///
    /// # Arguments
    /// * `future` - The work to run
    ///
    /// # Example
    /// ```ignore
    /// rt.spawn(async {
    ///     println!("Background task");
    /// });
    /// ```
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.hub.spawn(future)
    }

    /// Runs the hub until `future` completes and returns its output.
    ///
    /// Other tasks run alongside it; those still pending when the main
    /// future finishes stay scheduled on the hub.
    ///
    /// # Arguments
    /// * `future` - The main future
    ///
    /// # Returns
    /// The output of `future`.
    ///
    /// # Panics
    /// - if `future` panics (the panic is re-raised here),
    /// - if nothing is left that could ever wake `future` (a deadlock),
    /// - if the hub is aborted first, or is already running.
    ///
    /// # Example
    /// ```ignore
    /// let result = rt.block_on(async { 42 });
    /// assert_eq!(result, 42);
    /// ```
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let hub = self.hub.clone();

        enter_hub(hub.clone(), || {
            let handle = hub.spawn(future);

            match hub.run_until(&|| handle.is_finished(), true) {
                Ok(Exit::Finished) => {}
                Ok(Exit::Aborted) => {
                    handle.abandon();
                    panic!("hub was aborted before the main future completed");
                }
                Ok(Exit::Stalled) => {
                    handle.abandon();
                    panic!("deadlock: the main future is waiting for something that can never happen");
                }
                Err(err) => panic!("hub failed: {err}"),
            }

            match handle.take_result() {
                Some(Ok(value)) => value,
                Some(Err(TaskError::Panicked(message))) => panic!("{message}"),
                Some(Err(TaskError::Killed)) => panic!("main future was killed"),
                None => panic!("main future finished without a result"),
            }
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
