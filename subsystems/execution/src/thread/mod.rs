//! # Thread Management
//!
//! Kernel threads: creation, the entry trampoline and exit.

mod registry;
mod states;
#[allow(clippy::module_inception)]
mod thread;

pub use registry::{registry, ThreadRegistry};
pub use states::ThreadState;
pub use thread::{HeldLocks, Thread, ThreadRef};

use crate::{scheduler, ExecResult, ThreadId};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kestrel_hal::CpuId;

/// Create a thread that runs `body` once made runnable
///
/// The thread is registered and in the `Setup` state.
pub fn create<F>(name: &str, body: F) -> ExecResult<ThreadRef>
where
    F: FnOnce() + Send + 'static,
{
    let context = kestrel_core::hal()
        .contexts()
        .create(name, Box::new(move || trampoline(body)))?;
    let thread = Arc::new(Thread::new(ThreadId::new(), name, context));
    scheduler::thread_setup(&thread);
    registry().register(thread.clone())?;
    log::debug!("thread {} ({}) created", thread.id(), thread.name());
    Ok(thread)
}

/// Create a thread and make it runnable
pub fn spawn<F>(name: &str, body: F) -> ExecResult<ThreadRef>
where
    F: FnOnce() + Send + 'static,
{
    let thread = create(name, body)?;
    scheduler::thread_runnable(&thread);
    Ok(thread)
}

/// Create a thread that only ever runs on `cpu` and make it runnable
pub fn spawn_pinned<F>(name: &str, cpu: CpuId, body: F) -> ExecResult<ThreadRef>
where
    F: FnOnce() + Send + 'static,
{
    let thread = create(name, body)?;
    if let Err(err) = scheduler::cpu_pin_to(&thread, cpu) {
        if let Err(unregister) = registry().unregister(thread.id()) {
            log::warn!(
                "thread: unpinnable {} was not registered: {}",
                thread.id(),
                unregister
            );
        }
        return Err(err);
    }
    scheduler::thread_runnable(&thread);
    Ok(thread)
}

/// Terminate the calling thread
pub fn exit() -> ! {
    scheduler::exit_current()
}

fn trampoline<F: FnOnce()>(body: F) -> ! {
    scheduler::switch_finish();
    body();
    exit()
}
