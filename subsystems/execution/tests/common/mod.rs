//! Booted four-CPU machine shared by the execution integration tests.
//!
//! Test threads never call into the kernel themselves: work is handed to
//! the machine as a doorbell interrupt, which spawns a kernel thread that
//! reports its result over a channel.

#![allow(dead_code)]

use kestrel_core::mp;
use kestrel_execution::{boot, thread};
use kestrel_hal::hosted::HostedMachine;
use kestrel_hal::CpuId;
use log::LevelFilter;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::time::{Duration, Instant};

pub const CPUS: usize = 4;
pub const TIMEOUT: Duration = Duration::from_secs(120);

static BOARD: OnceLock<&'static HostedMachine> = OnceLock::new();
static BOOT: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// Boot the kernel if needed and return the machine
pub fn machine() -> &'static HostedMachine {
    BOOT.call_once(start);
    BOARD.get().copied().expect("machine booted")
}

/// Serialize tests that observe global scheduler state
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start() {
    let machine = HostedMachine::new(CPUS).expect("machine");
    BOARD.set(machine).expect("single machine");
    boot::start(machine, LevelFilter::Warn).expect("boot");

    let deadline = Instant::now() + TIMEOUT;
    while mp::running_mask().count() < CPUS as u32 {
        assert!(
            Instant::now() < deadline,
            "processors did not come online; fatal report: {:?}",
            machine.fatal_report()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A kernel thread started by [`spawn_kernel`]
pub struct Pending<T> {
    name: &'static str,
    result: mpsc::Receiver<T>,
}

impl<T> Pending<T> {
    /// Wait for the thread's result
    pub fn join(self) -> T {
        match self.result.recv_timeout(TIMEOUT) {
            Ok(value) => value,
            Err(mpsc::RecvTimeoutError::Disconnected) => panic!(
                "kernel thread {} ended without a result; fatal report: {:?}",
                self.name,
                machine().fatal_report()
            ),
            Err(mpsc::RecvTimeoutError::Timeout) => panic!(
                "kernel thread {} did not finish; fatal report: {:?}",
                self.name,
                machine().fatal_report()
            ),
        }
    }
}

fn launch<T: Send + 'static>(
    name: &'static str,
    pin: Option<CpuId>,
    body: impl FnOnce() -> T + Send + 'static,
) -> Pending<T> {
    let (done, result) = mpsc::channel();
    machine().raise_doorbell(Box::new(move || {
        let body = move || {
            let _ = done.send(body());
        };
        let spawned = match pin {
            Some(cpu) => thread::spawn_pinned(name, cpu, body),
            None => thread::spawn(name, body),
        };
        // A failed spawn drops the sender, which the receiver reports.
        if let Err(err) = spawned {
            log::error!("cannot spawn {}: {}", name, err);
        }
    }));
    Pending { name, result }
}

/// Start `body` on a new kernel thread
pub fn spawn_kernel<T: Send + 'static>(
    name: &'static str,
    body: impl FnOnce() -> T + Send + 'static,
) -> Pending<T> {
    launch(name, None, body)
}

/// Start `body` on a new kernel thread pinned to `cpu`
pub fn spawn_kernel_on<T: Send + 'static>(
    name: &'static str,
    cpu: CpuId,
    body: impl FnOnce() -> T + Send + 'static,
) -> Pending<T> {
    launch(name, Some(cpu), body)
}

/// Run `body` on a new kernel thread and wait for its result
pub fn run_kernel<T: Send + 'static>(
    name: &'static str,
    body: impl FnOnce() -> T + Send + 'static,
) -> T {
    spawn_kernel(name, body).join()
}

/// Wait for the machine to report a fatal error
pub fn expect_fatal() -> String {
    match machine().wait_fatal(TIMEOUT) {
        Some(report) => report,
        None => panic!("no fatal error was reported"),
    }
}
