//! # Kernel Console

/// Output sink for kernel messages
pub trait Console: Send + Sync {
    /// Write a string to the console
    fn write_str(&self, s: &str);

    /// Report a fatal kernel error
    ///
    /// Called once by the fatal-error path before the CPU halts.
    fn report_fatal(&self, message: &str);
}
