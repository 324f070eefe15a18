//! # Processor Bring-up
//!
//! Brings the kernel from an installed platform to every processor
//! sitting in its idle loop, ready to run threads.
//!
//! The boot processor calls [`start`]. Each processor then enters
//! [`cpu_main`], turns its startup flow into its idle thread and loops
//! between the scheduler and a halt.

use crate::thread::{registry, Thread, ThreadRef};
use crate::{scheduler, ExecResult, ThreadId};
use alloc::format;
use alloc::sync::Arc;
use kestrel_core::{fatal, logging, mp, percpu};
use kestrel_hal::{CpuId, HardwareAbstractionLayer};
use log::LevelFilter;

/// Install `hal` and start every processor it reports
///
/// Returns once the processors have been handed [`cpu_main`]; they come
/// online asynchronously.
pub fn start(hal: &'static dyn HardwareAbstractionLayer, level: LevelFilter) -> ExecResult<()> {
    // A logger installed by an earlier boot stays in place.
    let _ = logging::init(level);
    kestrel_hal::install(hal)?;

    let count = hal.cpu().cpu_count();
    percpu::init(count);
    mp::init(count);
    scheduler::init(count);

    log::info!("boot: starting {} processor(s) on {}", count, hal.arch_name());
    hal.start_processors(cpu_main)?;
    Ok(())
}

/// Per-processor entry; becomes the idle thread of `cpu`
pub fn cpu_main(cpu: CpuId) -> ! {
    scheduler::cpu_attach(cpu);

    let idle = adopt_idle(cpu);
    scheduler::thread_setup(&idle);
    scheduler::cpu_idle(&idle);
    if let Err(err) = registry().register(idle.clone()) {
        fatal!("cannot register idle thread of {}: {}", cpu, err);
    }

    mp::cpu_online();
    let machine = kestrel_core::hal().cpu();
    // SAFETY: per-CPU state, the run queue and the idle thread are ready
    unsafe { machine.enable_interrupts() };

    loop {
        scheduler::schedule();
        machine.halt();
    }
}

fn adopt_idle(cpu: CpuId) -> ThreadRef {
    let context = kestrel_core::hal().contexts().adopt_current();
    Arc::new(Thread::new(
        ThreadId::new(),
        &format!("idle{}", cpu.as_u32()),
        context,
    ))
}
