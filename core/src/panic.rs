//! # Fatal Errors
//!
//! Contract violations in the kernel core are not recoverable. [`fatal`]
//! stops the offending CPU, asks every other CPU to stop and reports to the
//! kernel console. Only the first fatal error is reported; a CPU that fails
//! while another is already reporting halts silently.

use crate::mp;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kestrel_hal::CpuId;

const REPORT_CAPACITY: usize = 256;
const NO_CPU: u32 = u32::MAX;

static PANICKING: AtomicBool = AtomicBool::new(false);
static PANIC_CPU: AtomicU32 = AtomicU32::new(NO_CPU);

/// Stop the kernel with a diagnostic
///
/// Without an installed HAL or a processor identity there is no CPU to
/// halt, and the error unwinds as a Rust panic instead.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let hal = kestrel_hal::try_hal();
    let Some((hal, cpu)) = hal.and_then(|hal| Some((hal, hal.cpu().current_cpu_id()?))) else {
        panic!("kernel fatal error: {args}");
    };

    // SAFETY: this CPU never runs kernel code again
    unsafe { hal.cpu().disable_interrupts() };
    if PANICKING.swap(true, Ordering::SeqCst) {
        hal.cpu().halt_forever();
    }
    PANIC_CPU.store(cpu.as_u32(), Ordering::SeqCst);

    log::error!("fatal error on {}: {}", cpu, args);
    mp::stop_others();

    let mut report = heapless::String::<REPORT_CAPACITY>::new();
    // A report that does not fit is truncated
    let _ = write!(report, "{cpu}: {args}");
    hal.console().report_fatal(&report);
    hal.cpu().halt_forever()
}

/// Whether a fatal error is being handled
pub fn panicking() -> bool {
    PANICKING.load(Ordering::SeqCst)
}

/// Processor that raised the fatal error
pub fn panic_cpu() -> Option<CpuId> {
    match PANIC_CPU.load(Ordering::SeqCst) {
        NO_CPU => None,
        cpu => Some(CpuId::new(cpu)),
    }
}

/// Raise a fatal kernel error
///
/// Takes `format!`-style arguments and never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::panic::fatal(::core::format_args!($($arg)*))
    };
}
