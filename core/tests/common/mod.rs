//! Shared simulated machine for the core integration tests.
//!
//! The machine is booted once per test binary. Each CPU runs a loop that
//! executes jobs posted to its mailbox with interrupts enabled and halts
//! when there is nothing to do.

#![allow(dead_code)]

use kestrel_core::{mp, percpu};
use kestrel_hal::hosted::HostedMachine;
use kestrel_hal::{CpuAbstraction, CpuId};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::time::{Duration, Instant};

pub const CPUS: usize = 4;
pub const TIMEOUT: Duration = Duration::from_secs(30);

static BOARD: OnceLock<&'static HostedMachine> = OnceLock::new();
static BOOT: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// Boot the machine if needed and return it
pub fn machine() -> &'static HostedMachine {
    BOOT.call_once(boot);
    BOARD.get().copied().expect("machine booted")
}

/// Serialize tests that share kernel globals
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn boot() {
    let machine = HostedMachine::new(CPUS).expect("machine");
    BOARD.set(machine).expect("single machine");
    kestrel_hal::install(machine).expect("install HAL");
    percpu::init(CPUS);
    mp::init(CPUS);
    kestrel_hal::HardwareAbstractionLayer::start_processors(machine, cpu_loop)
        .expect("start processors");

    let deadline = Instant::now() + TIMEOUT;
    while mp::running_mask().count() < CPUS as u32 {
        assert!(Instant::now() < deadline, "processors did not come online");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn cpu_loop(_cpu: CpuId) -> ! {
    let machine = BOARD.get().copied().expect("machine registered");
    mp::cpu_online();
    // SAFETY: the simulated processor is fully set up
    unsafe { machine.enable_interrupts() };
    loop {
        match machine.take_posted() {
            Some(job) => job(),
            None => machine.halt(),
        }
    }
}

fn post<T: Send + 'static>(
    cpu: CpuId,
    job: impl FnOnce() -> T + Send + 'static,
) -> mpsc::Receiver<T> {
    let (done, result) = mpsc::channel();
    machine()
        .post(
            cpu,
            Box::new(move || {
                let _ = done.send(job());
            }),
        )
        .expect("post job");
    result
}

fn collect<T>(cpu: CpuId, result: &mpsc::Receiver<T>) -> T {
    match result.recv_timeout(TIMEOUT) {
        Ok(value) => value,
        Err(_) => panic!(
            "job on {cpu} did not finish; fatal report: {:?}",
            machine().fatal_report()
        ),
    }
}

/// Run `job` on `cpu` and wait for its result
pub fn run_on<T: Send + 'static>(cpu: CpuId, job: impl FnOnce() -> T + Send + 'static) -> T {
    let result = post(cpu, job);
    collect(cpu, &result)
}

/// Run `job` on every CPU at once and collect the results in CPU order
pub fn run_on_all<T: Send + 'static>(job: fn(CpuId) -> T) -> Vec<T> {
    let pending: Vec<_> = (0..CPUS as u32)
        .map(CpuId::new)
        .map(|cpu| (cpu, post(cpu, move || job(cpu))))
        .collect();
    pending
        .iter()
        .map(|(cpu, result)| collect(*cpu, result))
        .collect()
}
