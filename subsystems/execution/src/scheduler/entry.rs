//! # Scheduling Entries
//!
//! Per-thread scheduler bookkeeping, embedded in every [`Thread`].
//!
//! Each entry is guarded by the run-queue lock of [`SchedEntry::lock_cpu`]:
//! the queue the thread is linked into, else the CPU it last ran on, else
//! the boot CPU. Whoever moves a thread between queues holds both locks.
//!
//! [`Thread`]: crate::Thread

use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kestrel_core::config::MAX_CPUS;
use kestrel_hal::CpuId;
use static_assertions::const_assert;

bitflags! {
    /// Scheduling flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedFlags: u32 {
        /// Executing on `oncpu`
        const RUNNING = 1 << 0;
        /// Only runs on its pinned CPU
        const PINNED = 1 << 1;
        /// A processor's idle thread; never linked into a queue
        const IDLE = 1 << 2;
        /// Blocked in a sleep queue
        const SLEEPING = 1 << 3;
        /// Leaving for good
        const EXITING = 1 << 4;
    }
}

const NO_CPU: u32 = u32::MAX;

const_assert!(MAX_CPUS < NO_CPU as usize);

fn encode(cpu: Option<CpuId>) -> u32 {
    cpu.map_or(NO_CPU, CpuId::as_u32)
}

fn decode(raw: u32) -> Option<CpuId> {
    (raw != NO_CPU).then(|| CpuId::new(raw))
}

/// Scheduler state of one thread
pub struct SchedEntry {
    flags: AtomicU32,
    queue: AtomicU32,
    oncpu: AtomicU32,
    pinned: AtomicU32,
}

impl SchedEntry {
    pub(crate) const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            queue: AtomicU32::new(NO_CPU),
            oncpu: AtomicU32::new(NO_CPU),
            pinned: AtomicU32::new(NO_CPU),
        }
    }

    pub(crate) fn reset(&self) {
        self.flags.store(0, Ordering::SeqCst);
        self.queue.store(NO_CPU, Ordering::SeqCst);
        self.oncpu.store(NO_CPU, Ordering::SeqCst);
        self.pinned.store(NO_CPU, Ordering::SeqCst);
    }

    /// Current flags
    pub fn flags(&self) -> SchedFlags {
        SchedFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Whether every flag in `flags` is set
    pub fn contains(&self, flags: SchedFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn insert(&self, flags: SchedFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn remove(&self, flags: SchedFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Queue the thread is linked into
    pub fn queue(&self) -> Option<CpuId> {
        decode(self.queue.load(Ordering::SeqCst))
    }

    pub(crate) fn set_queue(&self, cpu: Option<CpuId>) {
        self.queue.store(encode(cpu), Ordering::SeqCst);
    }

    /// CPU the thread runs or last ran on
    pub fn oncpu(&self) -> Option<CpuId> {
        decode(self.oncpu.load(Ordering::SeqCst))
    }

    pub(crate) fn set_oncpu(&self, cpu: CpuId) {
        self.oncpu.store(cpu.as_u32(), Ordering::SeqCst);
    }

    /// CPU the thread is pinned to
    pub fn pinned_cpu(&self) -> Option<CpuId> {
        decode(self.pinned.load(Ordering::SeqCst))
    }

    pub(crate) fn pin(&self, cpu: CpuId) {
        self.pinned.store(cpu.as_u32(), Ordering::SeqCst);
        self.insert(SchedFlags::PINNED);
    }

    /// Whether this is an idle thread
    pub fn is_idle(&self) -> bool {
        self.contains(SchedFlags::IDLE)
    }

    /// Run queue whose lock guards this entry
    pub fn lock_cpu(&self) -> CpuId {
        self.queue()
            .or_else(|| self.oncpu())
            .unwrap_or(CpuId::BOOT)
    }

    /// Whether `pick` may choose this thread on `cpu`
    pub(crate) fn is_eligible(&self, cpu: CpuId) -> bool {
        let blocked =
            SchedFlags::RUNNING | SchedFlags::IDLE | SchedFlags::SLEEPING | SchedFlags::EXITING;
        !self.flags().intersects(blocked) && self.pinned_cpu().map_or(true, |pin| pin == cpu)
    }
}

impl fmt::Debug for SchedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedEntry")
            .field("flags", &self.flags())
            .field("queue", &self.queue())
            .field("oncpu", &self.oncpu())
            .field("pinned", &self.pinned_cpu())
            .finish()
    }
}
