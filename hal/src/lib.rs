//! # Kestrel HAL - Hardware Abstraction Layer
//!
//! This crate defines the traits through which the kernel core reaches the
//! machine. The core never issues an instruction that touches interrupt
//! state, processor identity or execution contexts directly; it asks the
//! installed [`HardwareAbstractionLayer`].
//!
//! ## Pieces
//!
//! - [`cpu::CpuAbstraction`]: processor identity, interrupt masking, spin hints, halting
//! - [`interrupts::InterruptController`]: inter-processor interrupts
//! - [`context::ContextSwitch`]: kernel thread contexts and the switch between them
//! - [`console::Console`]: the kernel console and the fatal-report path
//!
//! With the `hosted` feature the crate also provides [`hosted::HostedMachine`],
//! a simulated shared-memory multiprocessor built from host threads.

#![cfg_attr(not(feature = "hosted"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod console;
pub mod context;
pub mod cpu;
pub mod interrupts;

#[cfg(feature = "hosted")]
pub mod hosted;

pub use console::Console;
pub use context::{ContextEntry, ContextSwitch, ExecutionContext};
pub use cpu::{CpuAbstraction, CpuId};
pub use interrupts::{InterruptController, InterruptVector, IpiHandler, IpiTarget};

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource is not available
    ResourceBusy,
    /// Memory or host resources for a new context could not be obtained
    OutOfMemory,
    /// The HAL has not been installed yet
    NotInitialized,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HalError::NotSupported => "operation not supported",
            HalError::InvalidParameter => "invalid parameter",
            HalError::ResourceBusy => "resource busy",
            HalError::OutOfMemory => "out of memory",
            HalError::NotInitialized => "HAL not initialized",
        };
        f.write_str(text)
    }
}

/// The main HAL trait that platform implementations must provide
///
/// This trait aggregates all sub-traits needed for a complete platform.
/// Every accessor returns a trait object so the kernel can hold the
/// platform behind a single `&'static dyn HardwareAbstractionLayer`.
pub trait HardwareAbstractionLayer: Send + Sync + 'static {
    /// Get the CPU abstraction
    fn cpu(&self) -> &dyn CpuAbstraction;

    /// Get the interrupt controller
    fn interrupt_controller(&self) -> &dyn InterruptController;

    /// Get the context switcher
    fn contexts(&self) -> &dyn ContextSwitch;

    /// Get the kernel console
    fn console(&self) -> &dyn Console;

    /// Get the platform name
    fn arch_name(&self) -> &'static str;

    /// Bring every present processor into `entry`
    ///
    /// Each processor calls `entry` with its own id, on its own startup
    /// stack, with interrupts disabled.
    fn start_processors(&self, entry: fn(CpuId) -> !) -> HalResult<()>;
}

static HAL: spin::Once<&'static dyn HardwareAbstractionLayer> = spin::Once::new();

/// Install the platform implementation
///
/// May be called once; later calls fail with [`HalError::ResourceBusy`].
pub fn install(hal: &'static dyn HardwareAbstractionLayer) -> HalResult<()> {
    let mut installed = false;
    HAL.call_once(|| {
        installed = true;
        hal
    });
    if installed {
        log::info!("HAL installed: {}", hal.arch_name());
        Ok(())
    } else {
        Err(HalError::ResourceBusy)
    }
}

/// Get the installed platform, if any
#[inline]
pub fn try_hal() -> Option<&'static dyn HardwareAbstractionLayer> {
    HAL.get().copied()
}
