//! # Execution Contexts
//!
//! The saved register state of a kernel thread, and the primitive that
//! moves a processor from one context to another.

use crate::HalResult;
use alloc::boxed::Box;
use core::any::Any;

/// Code a new context starts executing on its first switch-in
///
/// The entry never returns normally; a kernel thread leaves through
/// [`ContextSwitch::exit`].
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

/// A saved execution context
pub trait ExecutionContext: Send + Sync + 'static {
    /// Access the concrete context type of the platform
    fn as_any(&self) -> &dyn Any;
}

/// Context creation and switching
pub trait ContextSwitch: Send + Sync {
    /// Create a context that runs `entry` the first time it is switched to
    fn create(&self, name: &str, entry: ContextEntry) -> HalResult<Box<dyn ExecutionContext>>;

    /// Wrap the flow currently executing on this CPU in a context
    ///
    /// Used for the startup flow of each processor, which becomes its idle thread.
    fn adopt_current(&self) -> Box<dyn ExecutionContext>;

    /// Save the running state into `from` and resume `to` on this CPU
    ///
    /// Returns when some CPU later switches back to `from`; that CPU may
    /// differ from the one `switch` was called on.
    ///
    /// # Safety
    /// `from` must be the context currently executing on this CPU and `to`
    /// must not be executing anywhere.
    unsafe fn switch(&self, from: &dyn ExecutionContext, to: &dyn ExecutionContext);

    /// Abandon `from` permanently and resume `to` on this CPU
    ///
    /// # Safety
    /// Same as [`ContextSwitch::switch`]; additionally nothing on the
    /// current stack may be used again.
    unsafe fn exit(&self, from: &dyn ExecutionContext, to: &dyn ExecutionContext) -> !;
}
