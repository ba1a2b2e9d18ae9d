//! # Error Types
//!
//! Allocation errors are recoverable and handed back to the caller, who
//! decides how severe they are: boot-critical allocations panic, best-effort
//! ones degrade. The variants marked fatal are never returned; the kernel
//! panics with their message instead.

use thiserror::Error;

/// Failure of a buddy pool request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The request needs a block larger than the pool's biggest block.
    #[error("requested order {order} exceeds the pool maximum of {max}")]
    OutOfRange { order: u8, max: u8 },

    /// No free block of the requested order or larger is left.
    #[error("no free block of order {0} or larger")]
    OutOfMemory(u8),
}

/// Kernel-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A control block or stack could not be allocated.
    #[error("task allocation failed: {0}")]
    Alloc(#[from] AllocError),

    /// Every slot of the scheduler's node arena is taken.
    #[error("task table full")]
    TaskTableFull,

    /// The ready ring has no tasks to switch to. Fatal.
    #[error("no tasks to run")]
    EmptyReadyRing,

    /// A semaphore is locked but has no holder recorded. Fatal.
    #[error("semaphore locked with no holder recorded")]
    InconsistentLockState,

    /// The `TaskId` doesn't name a node in the arena.
    #[error("unknown task")]
    UnknownTask,

    /// A task's memory can't be freed while it runs on its own stack.
    #[error("cannot free the running task")]
    TaskRunning,

    /// A task was switched away from with its stack pointer outside its
    /// stack. Fatal.
    #[error("task stack overflowed")]
    StackOverflow,

    /// The holder of a contended semaphore waits on one the caller holds.
    /// Fatal.
    #[error("deadlock: the semaphore holder waits on a semaphore the caller holds")]
    Deadlock,

    /// A task tried to hold more than `HELD_SEMAPHORES_MAX` semaphores.
    /// Fatal.
    #[error("too many semaphores held by one task")]
    TooManyHeld,
}
