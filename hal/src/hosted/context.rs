//! Host-thread backed execution contexts.
//!
//! A context owns a host thread that blocks until a processor hands itself
//! over. Switching passes the processor to the target and parks the caller
//! until some processor hands one back.

use super::{current_cpu, lock, set_current_cpu, FatalSlot, HostedMachine};
use crate::{ContextEntry, ContextSwitch, CpuId, ExecutionContext, HalError, HalResult};
use core::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A kernel flow backed by a host thread
#[derive(Debug)]
pub struct HostedContext {
    name: String,
    resume: Mutex<Option<CpuId>>,
    resumed: Condvar,
}

impl HostedContext {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            resume: Mutex::new(None),
            resumed: Condvar::new(),
        })
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    fn resume_on(&self, cpu: CpuId) {
        *lock(&self.resume) = Some(cpu);
        self.resumed.notify_one();
    }

    fn wait_resumed(&self) -> CpuId {
        let mut slot = lock(&self.resume);
        loop {
            if let Some(cpu) = slot.take() {
                return cpu;
            }
            slot = self
                .resumed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct ContextHandle(Arc<HostedContext>);

impl ExecutionContext for ContextHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Unwind payload that retires the host thread of an exited context
struct ContextExit;

fn handle(context: &dyn ExecutionContext) -> &HostedContext {
    match context.as_any().downcast_ref::<ContextHandle>() {
        Some(handle) => &handle.0,
        None => panic!("execution context was not created by the hosted machine"),
    }
}

fn switching_cpu() -> CpuId {
    match current_cpu() {
        Some(cpu) => cpu,
        None => panic!("context switch outside a simulated processor"),
    }
}

fn describe(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

fn run_context(context: Arc<HostedContext>, entry: ContextEntry, fatal: Arc<FatalSlot>) {
    let cpu = context.wait_resumed();
    set_current_cpu(Some(cpu));
    let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
    set_current_cpu(None);
    match outcome {
        Ok(()) => fatal.record(format!("context {} returned from its entry", context.name)),
        Err(payload) if payload.is::<ContextExit>() => {}
        Err(payload) => fatal.record(format!(
            "context {} panicked: {}",
            context.name,
            describe(&*payload)
        )),
    }
}

impl ContextSwitch for HostedMachine {
    fn create(&self, name: &str, entry: ContextEntry) -> HalResult<Box<dyn ExecutionContext>> {
        let context = HostedContext::new(name);
        let parked = Arc::clone(&context);
        let fatal = Arc::clone(&self.fatal);
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_context(parked, entry, fatal))
            .map_err(|_| HalError::OutOfMemory)?;
        Ok(Box::new(ContextHandle(context)))
    }

    fn adopt_current(&self) -> Box<dyn ExecutionContext> {
        let name = std::thread::current()
            .name()
            .map_or_else(|| String::from("adopted"), str::to_owned);
        Box::new(ContextHandle(HostedContext::new(&name)))
    }

    unsafe fn switch(&self, from: &dyn ExecutionContext, to: &dyn ExecutionContext) {
        let cpu = switching_cpu();
        let (from, to) = (handle(from), handle(to));
        to.resume_on(cpu);
        let resumed = from.wait_resumed();
        set_current_cpu(Some(resumed));
    }

    unsafe fn exit(&self, from: &dyn ExecutionContext, to: &dyn ExecutionContext) -> ! {
        let cpu = switching_cpu();
        log::trace!("context {} exits on {}", handle(from).name, cpu);
        set_current_cpu(None);
        handle(to).resume_on(cpu);
        panic::resume_unwind(Box::new(ContextExit))
    }
}
