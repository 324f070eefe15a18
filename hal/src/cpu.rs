//! # CPU Abstraction
//!
//! Processor identity and the interrupt-enable state of the calling CPU.

use core::fmt;

/// Identifier of a processor
///
/// Processors are numbered densely from zero; `CpuId::BOOT` is the
/// processor that runs the boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor
    pub const BOOT: Self = Self(0);

    /// Create a CPU id from its raw number
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the id as an index into per-CPU tables
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// CPU abstraction trait
///
/// Every method acts on the calling processor.
pub trait CpuAbstraction: Send + Sync {
    /// Get the current CPU ID
    ///
    /// Returns `None` while the caller has no processor identity yet
    /// (early boot, or a flow that is not running on a processor).
    fn current_cpu_id(&self) -> Option<CpuId>;

    /// Get the number of CPUs present
    fn cpu_count(&self) -> usize;

    /// Check if interrupts are enabled
    fn interrupts_enabled(&self) -> bool;

    /// Enable interrupts
    ///
    /// Pending interrupts may be delivered before this returns.
    ///
    /// # Safety
    /// Enabling interrupts when the system is not ready can cause undefined behavior.
    unsafe fn enable_interrupts(&self);

    /// Disable interrupts
    ///
    /// # Safety
    /// Disabling interrupts for too long can cause system hangs.
    unsafe fn disable_interrupts(&self);

    /// Pause the CPU (for spin loops)
    fn pause(&self);

    /// Halt the CPU until an interrupt occurs
    fn halt(&self);

    /// Stop this CPU permanently
    fn halt_forever(&self) -> !;
}
