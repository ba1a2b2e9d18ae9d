//! # Board Kernel
//!
//! The single kernel instance of the firmware, its heap regions, the
//! built-in tasks, and free-function wrappers for application tasks.
//!
//! ```ignore
//! #[entry]
//! fn main() -> ! {
//!     let cp = cortex_m::Peripherals::take().unwrap();
//!     system::init();
//!     system::new_task(blink, 1).unwrap();
//!     system::start(cp)
//! }
//! ```

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::cortex_m4::{self, CortexM4};
use crate::config::{KERNEL_MAX_ORDER, USER_MAX_ORDER};
use crate::error::{AllocError, KernelError};
use crate::heap::HeapArea;
use crate::kernel::Kernel;
use crate::semaphore::Semaphore;
use crate::task::{Priority, TaskEntry, TaskId};

/// The board kernel. Every trap handler of the Cortex-M4 port lands here.
pub static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4);

static USER_HEAP: HeapArea<{ 1 << USER_MAX_ORDER }> = HeapArea::new();
static KERNEL_HEAP: HeapArea<{ 1 << KERNEL_MAX_ORDER }> = HeapArea::new();

static BOOTED: AtomicBool = AtomicBool::new(false);

/// Hand the heaps to the kernel and create the kernel and idle tasks.
///
/// # Panics
/// If called twice, or if the built-in tasks can't be created.
pub fn init() {
    if BOOTED.swap(true, Ordering::AcqRel) {
        panic!("system::init called twice");
    }

    // Safety: both areas are reserved for the kernel alone and no task runs
    unsafe { KERNEL.init_heap(USER_HEAP.base(), KERNEL_HEAP.base()) };

    if let Err(err) = KERNEL.spawn_system_tasks(kernel_task, idle_task) {
        panic!("boot: {}", err);
    }
}

/// Configure the tick and trap priorities and launch the first task.
/// **Does not return.**
pub fn start(mut cp: cortex_m::Peripherals) -> ! {
    // the first task launch unmasks interrupts again
    cortex_m::interrupt::disable();
    cortex_m4::set_interrupt_priorities(&mut cp.SCB);
    cortex_m4::configure_systick(&mut cp.SYST);
    KERNEL.start_task_switching()
}

/// Frees the memory of ended tasks.
extern "C" fn kernel_task() {
    loop {
        KERNEL.reap();
        KERNEL.yield_task();
    }
}

/// Keeps the ready ring non-empty.
extern "C" fn idle_task() {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Task API
// ---------------------------------------------------------------------------

pub fn new_task(entry: TaskEntry, priority: Priority) -> Result<TaskId, KernelError> {
    KERNEL.new_task(entry, priority)
}

pub fn yield_task() {
    KERNEL.yield_task();
}

pub fn end_task() {
    KERNEL.end_task();
}

pub fn current_task() -> Option<TaskId> {
    KERNEL.current_task()
}

pub fn num_tasks() -> usize {
    KERNEL.num_tasks()
}

pub fn task_exists(id: TaskId) -> bool {
    KERNEL.task_exists(id)
}

pub fn ticks() -> u32 {
    KERNEL.ticks()
}

// ---------------------------------------------------------------------------
// Memory API
// ---------------------------------------------------------------------------

pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    KERNEL.malloc(size)
}

/// # Safety
/// See [`Kernel::free`].
pub unsafe fn free(ptr: NonNull<u8>) {
    KERNEL.free(ptr);
}

pub fn kmalloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    KERNEL.kmalloc(size)
}

/// # Safety
/// See [`Kernel::kfree`].
pub unsafe fn kfree(ptr: NonNull<u8>) {
    KERNEL.kfree(ptr);
}

pub fn free_space() -> usize {
    KERNEL.free_space()
}

pub fn kernel_free_space() -> usize {
    KERNEL.kernel_free_space()
}

// ---------------------------------------------------------------------------
// Semaphores
// ---------------------------------------------------------------------------

pub fn acquire(sem: &Semaphore) {
    KERNEL.acquire(sem);
}

pub fn release(sem: &Semaphore) {
    KERNEL.release(sem);
}
