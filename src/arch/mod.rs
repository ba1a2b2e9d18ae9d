//! # Architecture Abstraction Layer
//!
//! The hardware boundary of the kernel. A [`Port`] knows how to lay out an
//! initial task context, how to trap into privileged code, how to request a
//! deferred context switch, and how to launch the first task. Everything
//! above it (scheduler, semaphores, pools) is portable.
//!
//! - `cortex_m4`: the board port (PendSV/SVCall/SysTick on ARMv7E-M).
//! - `frame`: the Armv7-M initial context layout the board port writes.
//! - `sim`: a host-side port for unit tests. Service calls run inline and
//!   pended switches run scripted steps in place of other tasks.

use crate::kernel::{Kernel, ServiceCall};
use crate::task::TaskEntry;

#[cfg(target_os = "none")]
pub mod cortex_m4;

#[cfg(any(target_os = "none", test))]
pub(crate) mod frame;

#[cfg(test)]
pub(crate) mod sim;

/// Hardware port.
///
/// # Safety
/// Implementors must deliver `supervisor_call` to [`Kernel::service_call`]
/// and pended switches to [`Kernel::context_switch`], both with interrupts
/// masked against each other, or the scheduler state races.
pub unsafe trait Port: Sized {
    /// Synthesize the initial context of a task on its stack, so that the
    /// first switch to it starts at `entry` and a return from `entry` ends
    /// the task. Returns the stack pointer to store in the control block.
    ///
    /// # Safety
    /// `top` must be one past the end of a writable stack large enough for
    /// a full context frame.
    unsafe fn init_stack(&self, top: *mut u32, entry: TaskEntry) -> *mut u32;

    /// Trap into privileged code and run `call` there. Returns the
    /// service's result word.
    fn supervisor_call(kernel: &Kernel<Self>, call: ServiceCall<'_>) -> usize;

    /// Request a context switch once the current exception (if any) returns.
    fn pend_switch(&self);

    /// Whether the caller runs in an exception handler.
    fn in_exception(&self) -> bool;

    /// Launch the task whose context sits at `sp`. Never returns.
    ///
    /// # Safety
    /// `sp` must come from [`Port::init_stack`] and the kernel must be
    /// ready to take traps.
    unsafe fn start_first_task(&self, sp: *mut u32) -> !;
}
