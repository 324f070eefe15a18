//! # Build Configuration
//!
//! Compile-time limits of the kernel core.

use static_assertions::const_assert;

cfg_if::cfg_if! {
    if #[cfg(feature = "smp")] {
        /// Maximum number of processors the kernel manages
        pub const MAX_CPUS: usize = 64;
    } else {
        /// Maximum number of processors the kernel manages
        pub const MAX_CPUS: usize = 1;
    }
}

/// Vector of the IPI that stops a processor
pub const IPI_STOP_VECTOR: u8 = 0xF2;

/// Vector of the IPI that pulls a processor into a rendezvous
pub const IPI_RENDEZVOUS_VECTOR: u8 = 0xF3;

/// Mutexes a single thread may hold at once while lock ordering is checked
pub const WITNESS_MAX_HELD: usize = 16;

// Processor masks are a single `u64`
const_assert!(MAX_CPUS >= 1 && MAX_CPUS <= 64);
const_assert!(IPI_STOP_VECTOR != IPI_RENDEZVOUS_VECTOR);
const_assert!(WITNESS_MAX_HELD >= 2);
