//! # Blocking Synchronization
//!
//! Primitives that put the calling thread to sleep. None of them may be
//! used inside a critical section or from interrupt context.

pub mod condvar;
pub mod mutex;
pub mod sleepq;
pub mod witness;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexFlags, MutexGuard};
pub use sleepq::Cookie;

use crate::thread::ThreadRef;
use kestrel_core::fatal;

/// The calling thread; fatal outside thread context
pub(crate) fn current_or_fatal(operation: &str) -> ThreadRef {
    match crate::scheduler::current_thread() {
        Some(thread) => thread,
        None => fatal!("{} outside thread context", operation),
    }
}
