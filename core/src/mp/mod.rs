//! # Multiprocessor Control
//!
//! Processor masks, IPI delivery and dispatch.
//!
//! A processor is *present* once the platform reports it and *running* once
//! it has joined the scheduler. A processor that took the stop IPI leaves
//! the running set and is recorded as *stopped*.

pub mod hokusai;
pub mod ipi;

pub use ipi::Ipi;

use crate::{config::MAX_CPUS, fatal, hal};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::{CpuId, InterruptVector, IpiTarget};

/// A set of processors
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Processors `0..count`
    pub const fn first(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// A set holding only `cpu`
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.as_u32())
    }

    /// Mask from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether `cpu` is in the set
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.as_u32()) != 0
    }

    /// The set with `cpu` added
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | 1 << cpu.as_u32())
    }

    /// The set with `cpu` removed
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu.as_u32()))
    }

    /// Processors in both sets
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Whether every member is also in `other`
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of processors in the set
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Members in ascending order
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..64u32)
            .filter(move |&bit| self.0 & (1 << bit) != 0)
            .map(CpuId::new)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

static PRESENT: AtomicU64 = AtomicU64::new(0);
static RUNNING: AtomicU64 = AtomicU64::new(0);
static STOPPED: AtomicU64 = AtomicU64::new(0);

/// Record the present processors and take over IPI dispatch
pub fn init(count: usize) {
    if count == 0 || count > MAX_CPUS {
        fatal!("{} processors reported, {} supported", count, MAX_CPUS);
    }
    PRESENT.store(CpuMask::first(count).bits(), Ordering::SeqCst);
    hal().interrupt_controller().set_ipi_handler(dispatch);
    log::info!("mp: {} processor(s) present", count);
}

/// Mark the calling processor as running
pub fn cpu_online() {
    let me = whoami();
    RUNNING.fetch_or(CpuMask::single(me).bits(), Ordering::SeqCst);
    log::info!("mp: {} online", me);
}

/// The calling processor
#[inline]
pub fn whoami() -> CpuId {
    match hal().cpu().current_cpu_id() {
        Some(cpu) => cpu,
        None => fatal!("processor identity requested outside a processor"),
    }
}

/// Present processors
pub fn present_mask() -> CpuMask {
    CpuMask(PRESENT.load(Ordering::SeqCst))
}

/// Running processors
pub fn running_mask() -> CpuMask {
    CpuMask(RUNNING.load(Ordering::SeqCst))
}

/// Stopped processors
pub fn stopped_mask() -> CpuMask {
    CpuMask(STOPPED.load(Ordering::SeqCst))
}

/// Whether `cpu` exists
pub fn cpu_present(cpu: CpuId) -> bool {
    present_mask().contains(cpu)
}

/// Whether `cpu` has joined the scheduler
pub fn cpu_running(cpu: CpuId) -> bool {
    running_mask().contains(cpu)
}

/// Whether `cpu` has been stopped
pub fn cpu_stopped(cpu: CpuId) -> bool {
    stopped_mask().contains(cpu)
}

// =============================================================================
// IPI delivery
// =============================================================================

fn send(target: IpiTarget, ipi: Ipi) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "smp")] {
            if let Err(err) = hal().interrupt_controller().send_ipi(target, ipi.vector()) {
                log::warn!("mp: {:?} to {:?} not sent: {}", ipi, target, err);
            }
        } else {
            let _ = (target, ipi);
        }
    }
}

/// Send `ipi` to `cpu`
pub fn ipi_send(cpu: CpuId, ipi: Ipi) {
    send(IpiTarget::Cpu(cpu), ipi);
}

/// Send `ipi` to every processor in `mask`
pub fn ipi_send_mask(mask: CpuMask, ipi: Ipi) {
    for cpu in mask.iter() {
        ipi_send(cpu, ipi);
    }
}

/// Send `ipi` to every running processor except the caller
pub fn ipi_send_others(ipi: Ipi) {
    ipi_send_mask(running_mask().without(whoami()), ipi);
}

/// Send `ipi` to every running processor, the caller included
pub fn ipi_send_all(ipi: Ipi) {
    ipi_send_mask(running_mask(), ipi);
}

/// Ask every other processor to stop
///
/// Used on the fatal path, so it never raises a fatal error itself.
pub fn stop_others() {
    let Some(me) = kestrel_hal::try_hal().and_then(|hal| hal.cpu().current_cpu_id()) else {
        return;
    };
    ipi_send_mask(present_mask().without(me), Ipi::Stop);
}

fn dispatch(vector: InterruptVector) {
    match Ipi::from_vector(vector) {
        Some(Ipi::Stop) => stop_self(),
        Some(Ipi::Rendezvous) => hokusai::handle_ipi(),
        None => log::warn!("mp: unexpected IPI vector {:#x}", vector),
    }
}

fn stop_self() -> ! {
    let me = whoami();
    let bit = CpuMask::single(me).bits();
    RUNNING.fetch_and(!bit, Ordering::SeqCst);
    STOPPED.fetch_or(bit, Ordering::SeqCst);
    hal().cpu().halt_forever()
}

// =============================================================================
// Tests
// =============================================================================
