//! # Critical Sections
//!
//! A critical section masks interrupts on the calling CPU. Sections nest:
//! the interrupt state is captured by the outermost [`enter`] and restored
//! by the matching outermost [`exit`]. Inner tokens carry no state of their
//! own, so sections must be closed in the reverse order they were opened.

use crate::{fatal, hal, percpu};
use kestrel_hal::CpuId;

/// Proof that the holder opened a critical section on `cpu`
///
/// Consumed by [`exit`].
#[must_use = "a critical section must be closed with `critical::exit`"]
#[derive(Debug)]
pub struct CriticalToken {
    cpu: CpuId,
}

impl CriticalToken {
    /// Processor the section was opened on
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

/// Open a critical section on the calling CPU
pub fn enter() -> CriticalToken {
    let Some(percpu) = percpu::current() else {
        fatal!("critical section entered before per-CPU storage exists");
    };
    let cpu = hal().cpu();
    let enabled = cpu.interrupts_enabled();
    // SAFETY: masking interrupts is always sound; they are restored by `exit`
    unsafe { cpu.disable_interrupts() };
    percpu.push_critical(enabled);
    CriticalToken { cpu: percpu.id() }
}

/// Close a critical section opened by [`enter`]
pub fn exit(token: CriticalToken) {
    let Some(percpu) = percpu::current() else {
        fatal!("critical section exited without per-CPU storage");
    };
    if token.cpu != percpu.id() {
        fatal!(
            "critical section opened on {} closed on {}",
            token.cpu,
            percpu.id()
        );
    }
    if percpu.critical_nest() == 0 {
        fatal!("critical section exit on {} without enter", percpu.id());
    }
    if percpu.pop_critical() == Some(true) {
        // SAFETY: interrupts were enabled when the outermost section opened
        unsafe { hal().cpu().enable_interrupts() };
    }
}

/// Whether the calling CPU is inside a critical section
#[inline]
pub fn in_critical() -> bool {
    nesting() > 0
}

/// Critical-section depth of the calling CPU
#[inline]
pub fn nesting() -> u32 {
    percpu::current().map_or(0, percpu::PerCpu::critical_nest)
}

// =============================================================================
// Tests
// =============================================================================
