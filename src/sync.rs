//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections for kernel state. Scheduler state is
//! only ever touched inside one, from trap context or before switching
//! starts, so the trap handlers and the boot path never race.
//!
//! Built on the `critical-section` crate. On the board the implementation
//! comes from `cortex-m` (single core, `cpsid`/`cpsie`); host tests use the
//! `std` implementation.

pub use critical_section::{CriticalSection, Mutex};

use core::cell::RefCell;

/// Execute a closure within a critical section (interrupts disabled).
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep the critical section short: SysTick and PendSV are held off for
/// its whole duration.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Run `f` on the value behind a `Mutex<RefCell<T>>`.
///
/// # Panics
/// If `f` re-enters the same mutex.
#[inline]
pub fn with_locked<T, R>(cell: &Mutex<RefCell<T>>, f: impl FnOnce(&mut T) -> R) -> R {
    critical_section(|cs| f(&mut cell.borrow_ref_mut(cs)))
}
