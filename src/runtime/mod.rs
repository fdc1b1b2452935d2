//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub(crate) mod waker;
pub mod yield_now;

pub use core::Runtime;
