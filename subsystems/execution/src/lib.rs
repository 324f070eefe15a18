//! # Kestrel Execution Subsystem
//!
//! The execution subsystem manages:
//! - Kernel threads and the thread registry
//! - The per-CPU run-queue scheduler
//! - Blocking synchronization: sleep queues, mutexes, condition variables
//! - Lock-order verification
//! - Processor bring-up into the idle loop
//!
//! ## Key Principle
//!
//! Spinlocks protect short, non-blocking sections and may be taken from
//! interrupt context. Everything that can put a thread to sleep lives here
//! and may only be used from thread context.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod boot;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use scheduler::current_thread;
pub use thread::{Thread, ThreadRef, ThreadState};

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::HalError;

/// Unique identifier for threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocate a new thread ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an ID from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
///
/// Contract violations are fatal and never show up here; these are the
/// failures a caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Thread not found
    ThreadNotFound,
    /// Already exists
    AlreadyExists,
    /// Out of resources
    OutOfResources,
    /// The scheduler is not running yet
    NotInitialized,
    /// No run queue exists for the requested CPU
    NoSuchCpu,
    /// The thread is not in a state that allows the request
    InvalidState,
    /// The platform refused the request
    Platform(HalError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::ThreadNotFound => f.write_str("thread not found"),
            ExecError::AlreadyExists => f.write_str("already exists"),
            ExecError::OutOfResources => f.write_str("out of resources"),
            ExecError::NotInitialized => f.write_str("scheduler not initialized"),
            ExecError::NoSuchCpu => f.write_str("no such CPU"),
            ExecError::InvalidState => f.write_str("invalid thread state"),
            ExecError::Platform(err) => write!(f, "platform error: {err}"),
        }
    }
}

impl From<HalError> for ExecError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => ExecError::OutOfResources,
            HalError::NotInitialized => ExecError::NotInitialized,
            other => ExecError::Platform(other),
        }
    }
}
