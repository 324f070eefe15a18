//! # Kestrel Kernel Core
//!
//! The lowest layer of the kernel proper. Everything above it relies on
//! the primitives defined here:
//!
//! - [`critical`]: per-CPU interrupt-masking critical sections
//! - [`spinlock`]: busy-wait locks built on critical sections
//! - [`mp`]: processor masks, IPIs and the Hokusai rendezvous
//! - [`panic`]: the fatal-error sink
//! - [`logging`]: the `log` backend over the kernel console
//!
//! The core reaches the machine only through the installed
//! [`kestrel_hal::HardwareAbstractionLayer`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod critical;
pub mod logging;
pub mod mp;
pub mod panic;
pub mod percpu;
pub mod spinlock;

pub use critical::CriticalToken;
pub use spinlock::{SpinGuard, SpinLocked, Spinlock, SpinlockFlags};

use kestrel_hal::HardwareAbstractionLayer;

/// Get the installed platform
///
/// Running without a HAL is a fatal error.
#[inline]
pub fn hal() -> &'static dyn HardwareAbstractionLayer {
    match kestrel_hal::try_hal() {
        Some(hal) => hal,
        None => fatal!("no hardware abstraction layer installed"),
    }
}
