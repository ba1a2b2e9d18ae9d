//! # Kestrel
//!
//! A small preemptive RTOS kernel for ARM Cortex-M4 microcontrollers:
//! round-robin task switching driven by SysTick, binary semaphores that hand
//! the CPU straight to the task that should run next, and two buddy-allocated
//! heaps that hold every task's control block and stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │           Board Kernel (system.rs, target only)        │
//! │   init() · new_task() · start() · malloc() · acquire() │
//! ├────────────────────────────────────────────────────────┤
//! │                Kernel Context (kernel.rs)              │
//! │      task lifecycle · service calls · switching        │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Scheduler   │   Semaphore      │  Heap Pools           │
//! │  scheduler.rs│   semaphore.rs   │  heap.rs · buddy.rs   │
//! │  ─ ready ring│   ─ test-and-set │  ─ user pool (stacks) │
//! │  ─ hand-off  │   ─ hand-off     │  ─ kernel pool (TCBs) │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │               Task Model (task.rs)                      │
//! │        TaskCtrl · TaskHandle · TaskId · Stack           │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)               │
//! │     PendSV · SVCall · SysTick · Stack Init             │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Two static heaps**: a 64 KiB user pool and a 32 KiB kernel pool,
//!   each a single buddy block at boot
//! - **Per-task memory**: the control block comes from the kernel pool, the
//!   stack from the user pool, both returned when the task is freed
//! - **Fixed task table**: at most `MAX_TASKS` registered tasks
//! - **Critical sections**: the `critical-section` crate, for scheduler state
//!
//! ## Crate Features
//!
//! - `firmware`: builds the demo image in `src/main.rs`

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod buddy;
pub mod config;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod task;

#[cfg(target_os = "none")]
pub mod system;

pub use error::{AllocError, KernelError};
pub use kernel::{Kernel, ServiceCall};
pub use semaphore::Semaphore;
pub use task::{Priority, TaskEntry, TaskHandle, TaskId};
