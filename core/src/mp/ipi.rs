//! Inter-processor interrupt kinds.

use crate::config::{IPI_RENDEZVOUS_VECTOR, IPI_STOP_VECTOR};
use kestrel_hal::InterruptVector;

/// An IPI understood by the kernel core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ipi {
    /// Halt the receiving CPU permanently
    Stop = IPI_STOP_VECTOR,
    /// Join the rendezvous in progress
    Rendezvous = IPI_RENDEZVOUS_VECTOR,
}

impl Ipi {
    /// Hardware vector of this IPI
    #[inline]
    pub const fn vector(self) -> InterruptVector {
        self as InterruptVector
    }

    /// IPI carried by `vector`, if it is one of ours
    pub const fn from_vector(vector: InterruptVector) -> Option<Self> {
        match vector {
            IPI_STOP_VECTOR => Some(Self::Stop),
            IPI_RENDEZVOUS_VECTOR => Some(Self::Rendezvous),
            _ => None,
        }
    }
}
