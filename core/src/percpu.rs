//! # Per-CPU Data
//!
//! Private state of each processor. The table is created once during boot;
//! before that, [`current`] returns `None` and the primitives that depend on
//! it either become no-ops (spinlocks) or fail (critical sections).

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kestrel_hal::CpuId;

/// State private to one processor
#[derive(Debug)]
pub struct PerCpu {
    id: CpuId,
    critical_nest: AtomicU32,
    saved_interrupts: AtomicBool,
}

impl PerCpu {
    fn new(id: CpuId) -> Self {
        Self {
            id,
            critical_nest: AtomicU32::new(0),
            saved_interrupts: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: CpuId) -> Self {
        Self::new(id)
    }

    /// The processor this block belongs to
    #[inline]
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Current critical-section depth
    #[inline]
    pub fn critical_nest(&self) -> u32 {
        self.critical_nest.load(Ordering::Relaxed)
    }

    // Only the owning CPU touches these, with interrupts masked.

    pub(crate) fn push_critical(&self, interrupts_were_enabled: bool) {
        if self.critical_nest.fetch_add(1, Ordering::Relaxed) == 0 {
            self.saved_interrupts
                .store(interrupts_were_enabled, Ordering::Relaxed);
        }
    }

    /// Returns `Some(restore)` when the outermost section closes.
    pub(crate) fn pop_critical(&self) -> Option<bool> {
        let nest = self.critical_nest.fetch_sub(1, Ordering::Relaxed) - 1;
        (nest == 0).then(|| self.saved_interrupts.load(Ordering::Relaxed))
    }
}

static PERCPU: spin::Once<Box<[PerCpu]>> = spin::Once::new();

/// Create the per-CPU table for `count` processors
pub fn init(count: usize) {
    PERCPU.call_once(|| {
        (0..count)
            .map(|index| PerCpu::new(CpuId::new(index as u32)))
            .collect()
    });
}

/// Number of processors with per-CPU state
pub fn count() -> usize {
    PERCPU.get().map_or(0, |table| table.len())
}

/// Per-CPU block of `cpu`
pub fn get(cpu: CpuId) -> Option<&'static PerCpu> {
    PERCPU.get()?.get(cpu.as_index())
}

/// Per-CPU block of the calling processor
#[inline]
pub fn current() -> Option<&'static PerCpu> {
    let cpu = kestrel_hal::try_hal()?.cpu().current_cpu_id()?;
    get(cpu)
}
