//! # Kestrel Configuration
//!
//! Compile-time constants governing the heaps, the task table and the
//! system tick. All limits are fixed at compile time; the heaps never grow
//! past the regions reserved at boot.

/// Size of the allocation header that precedes every payload handed out by
/// a buddy pool. One machine word: the block's order lives in its low byte.
pub const HEADER_SIZE: usize = core::mem::size_of::<usize>();

/// Smallest block the user pool hands out (`2^4` = 16 bytes).
pub const USER_MIN_ORDER: u8 = 4;

/// The user pool is a single block of `2^16` = 64 KiB at boot.
pub const USER_MAX_ORDER: u8 = 16;

/// Smallest block the kernel pool hands out.
pub const KERNEL_MIN_ORDER: u8 = 4;

/// The kernel pool is a single block of `2^15` = 32 KiB at boot.
pub const KERNEL_MAX_ORDER: u8 = 15;

/// Order of the user-pool block backing each task stack.
///
/// The stack fills the block exactly, so a stack costs `2^STACK_ORDER`
/// bytes of user heap and nothing more.
pub const STACK_ORDER: u8 = 10;

/// Usable stack bytes per task: the stack block minus its allocation header.
pub const STACK_BYTES: usize = (1 << STACK_ORDER) - HEADER_SIZE;

/// Per-task stack size in words. Must cover the deepest call chain plus the
/// hardware exception frame (8 words) and the software-saved context
/// (8 words for R4–R11).
pub const STACK_WORDS: usize = STACK_BYTES / core::mem::size_of::<u32>();

/// Capacity of the scheduler's node arena, i.e. the maximum number of
/// registered tasks (including the kernel and idle tasks).
pub const MAX_TASKS: usize = 16;

/// Semaphores one task may hold at the same time.
pub const HELD_SEMAPHORES_MAX: usize = 8;

/// SysTick frequency in Hz. Every tick pends a round-robin switch.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Priority of the built-in kernel task that releases the memory of ended
/// tasks. Larger is more urgent.
pub const KERNEL_TASK_PRIORITY: u8 = 10;

/// Priority of the idle task, which keeps the ready ring non-empty.
pub const IDLE_TASK_PRIORITY: u8 = 0;
