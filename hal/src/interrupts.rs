//! # Interrupt Controller Abstraction
//!
//! Only inter-processor interrupts are modelled here; device interrupt
//! routing belongs to the drivers that own the devices.

use crate::{CpuId, HalResult};

/// Interrupt vector number
pub type InterruptVector = u8;

/// Handler invoked on the receiving CPU for every IPI, with interrupts disabled
pub type IpiHandler = fn(vector: InterruptVector);

/// Interrupt controller abstraction
pub trait InterruptController: Send + Sync {
    /// Register the kernel's IPI dispatcher
    fn set_ipi_handler(&self, handler: IpiHandler);

    /// Send an Inter-Processor Interrupt
    fn send_ipi(&self, target: IpiTarget, vector: InterruptVector) -> HalResult<()>;
}

/// Target for Inter-Processor Interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    /// Send to self
    Current,
    /// Send to a specific CPU
    Cpu(CpuId),
    /// Send to all CPUs
    All,
    /// Send to all CPUs except self
    AllExceptSelf,
}
