//! # Hosted Machine
//!
//! A simulated shared-memory multiprocessor for running the kernel on a
//! development host.
//!
//! - Each simulated processor starts on its own host thread.
//! - Every kernel thread context is backed by a host thread that only
//!   executes while some processor has switched to it, so each processor
//!   runs at most one kernel flow at a time.
//! - The interrupt-enable state is a per-processor flag. IPIs set pending
//!   bits on the target and are taken when it enables interrupts, pauses in
//!   a spin loop or halts.
//! - Host code can ring a doorbell: the job runs in interrupt context on the
//!   first processor that takes it. Jobs can also be posted to a specific
//!   processor's mailbox, which that processor's main loop drains itself.
//! - Fatal reports are captured so a host harness can observe them.

mod context;

pub use context::HostedContext;

use crate::{
    Console, ContextSwitch, CpuAbstraction, CpuId, HalError, HalResult, HardwareAbstractionLayer,
    InterruptController, InterruptVector, IpiHandler, IpiTarget,
};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

std::thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

fn current_cpu() -> Option<CpuId> {
    CURRENT_CPU.with(Cell::get)
}

fn set_current_cpu(cpu: Option<CpuId>) {
    CURRENT_CPU.with(|slot| slot.set(cpu));
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A job run on a simulated processor
pub type HostJob = Box<dyn FnOnce() + Send + 'static>;

/// Largest machine the simulation supports
pub const MAX_SIMULATED_CPUS: usize = 64;

// IPI targets and kernel CPU masks are 64-bit
static_assertions::const_assert!(MAX_SIMULATED_CPUS <= u64::BITS as usize);

const HALT_INTERVAL: Duration = Duration::from_micros(50);

// =============================================================================
// Simulated Processor
// =============================================================================

struct SimulatedCpu {
    interrupts: AtomicBool,
    pending: [AtomicU64; 4],
    mailbox: Mutex<VecDeque<HostJob>>,
}

impl SimulatedCpu {
    fn new() -> Self {
        Self {
            interrupts: AtomicBool::new(false),
            pending: Default::default(),
            mailbox: Mutex::new(VecDeque::new()),
        }
    }

    fn raise(&self, vector: InterruptVector) {
        let index = usize::from(vector);
        self.pending[index / 64].fetch_or(1 << (index % 64), Ordering::SeqCst);
    }

    fn take_pending(&self) -> Option<InterruptVector> {
        for (word, bits) in self.pending.iter().enumerate() {
            let mut current = bits.load(Ordering::SeqCst);
            while current != 0 {
                let mask = 1u64 << current.trailing_zeros();
                if bits.fetch_and(!mask, Ordering::SeqCst) & mask != 0 {
                    return Some((word * 64) as u8 + current.trailing_zeros() as u8);
                }
                current = bits.load(Ordering::SeqCst);
            }
        }
        None
    }
}

enum Delivery {
    Ipi(InterruptVector),
    Doorbell(HostJob),
}

// =============================================================================
// Fatal Report Capture
// =============================================================================

#[derive(Default)]
struct FatalSlot {
    message: Mutex<Option<String>>,
    raised: Condvar,
}

impl FatalSlot {
    fn record(&self, message: String) {
        let mut slot = lock(&self.message);
        if slot.is_none() {
            *slot = Some(message);
        }
        self.raised.notify_all();
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A simulated multiprocessor
pub struct HostedMachine {
    cpus: Box<[SimulatedCpu]>,
    ipi_handler: spin::Once<IpiHandler>,
    doorbell: Mutex<VecDeque<HostJob>>,
    fatal: Arc<FatalSlot>,
    output: Mutex<()>,
}

impl core::fmt::Debug for HostedMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostedMachine")
            .field("cpus", &self.cpus.len())
            .finish_non_exhaustive()
    }
}

impl HostedMachine {
    /// Create a machine with `cpu_count` processors
    ///
    /// The machine lives for the rest of the process, as hardware does.
    pub fn new(cpu_count: usize) -> HalResult<&'static Self> {
        if cpu_count == 0 || cpu_count > MAX_SIMULATED_CPUS {
            return Err(HalError::InvalidParameter);
        }
        let cpus = (0..cpu_count).map(|_| SimulatedCpu::new()).collect();
        Ok(Box::leak(Box::new(Self {
            cpus,
            ipi_handler: spin::Once::new(),
            doorbell: Mutex::new(VecDeque::new()),
            fatal: Arc::new(FatalSlot::default()),
            output: Mutex::new(()),
        })))
    }

    /// Ring the doorbell: run `job` in interrupt context on some processor
    pub fn raise_doorbell(&self, job: HostJob) {
        lock(&self.doorbell).push_back(job);
    }

    /// Queue `job` in the mailbox of `cpu`
    pub fn post(&self, cpu: CpuId, job: HostJob) -> HalResult<()> {
        let target = self.cpus.get(cpu.as_index()).ok_or(HalError::InvalidParameter)?;
        lock(&target.mailbox).push_back(job);
        Ok(())
    }

    /// Take the next job from the calling processor's mailbox
    pub fn take_posted(&self) -> Option<HostJob> {
        lock(&self.this_cpu()?.mailbox).pop_front()
    }

    /// The first fatal report, if one was made
    pub fn fatal_report(&self) -> Option<String> {
        lock(&self.fatal.message).clone()
    }

    /// Wait up to `timeout` for a fatal report
    pub fn wait_fatal(&self, timeout: Duration) -> Option<String> {
        let slot = lock(&self.fatal.message);
        let (slot, _) = self
            .fatal
            .raised
            .wait_timeout_while(slot, timeout, |message| message.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    fn this_cpu(&self) -> Option<&SimulatedCpu> {
        self.cpus.get(current_cpu()?.as_index())
    }

    fn deliver_pending(&self) {
        let Some(cpu) = self.this_cpu() else {
            return;
        };
        while cpu.interrupts.load(Ordering::SeqCst) {
            let delivery = match cpu.take_pending() {
                Some(vector) => Delivery::Ipi(vector),
                None => match lock(&self.doorbell).pop_front() {
                    Some(job) => Delivery::Doorbell(job),
                    None => break,
                },
            };
            cpu.interrupts.store(false, Ordering::SeqCst);
            match delivery {
                Delivery::Ipi(vector) => match self.ipi_handler.get() {
                    Some(handler) => handler(vector),
                    None => log::warn!("IPI {:#x} dropped: no handler", vector),
                },
                Delivery::Doorbell(job) => job(),
            }
            cpu.interrupts.store(true, Ordering::SeqCst);
        }
    }
}

impl CpuAbstraction for HostedMachine {
    fn current_cpu_id(&self) -> Option<CpuId> {
        current_cpu().filter(|cpu| cpu.as_index() < self.cpus.len())
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn interrupts_enabled(&self) -> bool {
        self.this_cpu()
            .is_some_and(|cpu| cpu.interrupts.load(Ordering::SeqCst))
    }

    unsafe fn enable_interrupts(&self) {
        if let Some(cpu) = self.this_cpu() {
            cpu.interrupts.store(true, Ordering::SeqCst);
            self.deliver_pending();
        }
    }

    unsafe fn disable_interrupts(&self) {
        if let Some(cpu) = self.this_cpu() {
            cpu.interrupts.store(false, Ordering::SeqCst);
        }
    }

    fn pause(&self) {
        core::hint::spin_loop();
        std::thread::yield_now();
        self.deliver_pending();
    }

    fn halt(&self) {
        self.deliver_pending();
        std::thread::sleep(HALT_INTERVAL);
        self.deliver_pending();
    }

    fn halt_forever(&self) -> ! {
        if let Some(cpu) = self.this_cpu() {
            cpu.interrupts.store(false, Ordering::SeqCst);
        }
        loop {
            std::thread::park();
        }
    }
}

impl InterruptController for HostedMachine {
    fn set_ipi_handler(&self, handler: IpiHandler) {
        self.ipi_handler.call_once(|| handler);
    }

    fn send_ipi(&self, target: IpiTarget, vector: InterruptVector) -> HalResult<()> {
        let me = self.current_cpu_id();
        match target {
            IpiTarget::Current => {
                let cpu = me.ok_or(HalError::InvalidParameter)?;
                self.cpus[cpu.as_index()].raise(vector);
            }
            IpiTarget::Cpu(cpu) => {
                self.cpus
                    .get(cpu.as_index())
                    .ok_or(HalError::InvalidParameter)?
                    .raise(vector);
            }
            IpiTarget::All | IpiTarget::AllExceptSelf => {
                let skip = if target == IpiTarget::AllExceptSelf { me } else { None };
                for (index, cpu) in self.cpus.iter().enumerate() {
                    if skip.map(CpuId::as_index) != Some(index) {
                        cpu.raise(vector);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Console for HostedMachine {
    fn write_str(&self, s: &str) {
        let _serial = lock(&self.output);
        eprint!("{s}");
    }

    fn report_fatal(&self, message: &str) {
        {
            let _serial = lock(&self.output);
            eprintln!("*** FATAL: {message}");
        }
        self.fatal.record(message.to_owned());
    }
}

impl HardwareAbstractionLayer for HostedMachine {
    fn cpu(&self) -> &dyn CpuAbstraction {
        self
    }

    fn interrupt_controller(&self) -> &dyn InterruptController {
        self
    }

    fn contexts(&self) -> &dyn ContextSwitch {
        self
    }

    fn console(&self) -> &dyn Console {
        self
    }

    fn arch_name(&self) -> &'static str {
        "hosted"
    }

    fn start_processors(&self, entry: fn(CpuId) -> !) -> HalResult<()> {
        for index in 0..self.cpus.len() {
            let cpu = CpuId::new(index as u32);
            std::thread::Builder::new()
                .name(format!("{cpu}"))
                .spawn(move || {
                    set_current_cpu(Some(cpu));
                    entry(cpu)
                })
                .map_err(|_| HalError::OutOfMemory)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_bounds() {
        assert_eq!(HostedMachine::new(0).err(), Some(HalError::InvalidParameter));
        assert!(HostedMachine::new(MAX_SIMULATED_CPUS + 1).is_err());
        let machine = HostedMachine::new(2).expect("machine");
        assert_eq!(machine.cpu_count(), 2);
    }

    #[test]
    fn test_pending_vectors_are_taken_once() {
        let cpu = SimulatedCpu::new();
        cpu.raise(0xf2);
        cpu.raise(0x03);
        cpu.raise(0xf2);
        assert_eq!(cpu.take_pending(), Some(0x03));
        assert_eq!(cpu.take_pending(), Some(0xf2));
        assert_eq!(cpu.take_pending(), None);
    }

    #[test]
    fn test_no_identity_outside_processors() {
        let machine = HostedMachine::new(1).expect("machine");
        assert_eq!(machine.current_cpu_id(), None);
        assert!(!machine.interrupts_enabled());
        assert_eq!(
            machine.send_ipi(IpiTarget::Current, 0xf2),
            Err(HalError::InvalidParameter)
        );
        assert_eq!(
            machine.send_ipi(IpiTarget::Cpu(CpuId::new(3)), 0xf2),
            Err(HalError::InvalidParameter)
        );
    }

    #[test]
    fn test_fatal_report_keeps_first() {
        let machine = HostedMachine::new(1).expect("machine");
        assert_eq!(machine.fatal_report(), None);
        machine.fatal.record("first".into());
        machine.fatal.record("second".into());
        assert_eq!(
            machine.wait_fatal(Duration::from_millis(10)).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_processor_takes_ipi_when_enabled() {
        static TAKEN: AtomicU64 = AtomicU64::new(0);
        fn handler(vector: InterruptVector) {
            TAKEN.fetch_add(u64::from(vector), Ordering::SeqCst);
        }

        let machine = HostedMachine::new(1).expect("machine");
        machine.set_ipi_handler(handler);
        let worker = std::thread::spawn(move || {
            set_current_cpu(Some(CpuId::BOOT));
            machine.send_ipi(IpiTarget::Current, 7).expect("send");
            assert_eq!(TAKEN.load(Ordering::SeqCst), 0);
            // SAFETY: simulated processor, nothing depends on the mask
            unsafe { machine.enable_interrupts() };
            TAKEN.load(Ordering::SeqCst)
        });
        assert_eq!(worker.join().expect("worker"), 7);
    }
}
