//! # Kestrel Example Firmware
//!
//! Four application tasks next to the built-in kernel and idle tasks:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `counter_task` | 3 | Increments a shared counter under `LEDGER_LOCK` |
//! | `auditor_task` | 5 | Checks the counter's shadow copy under the same lock |
//! | `scratch_task` | 2 | Allocates a user-heap buffer, fills it, frees it |
//! | `one_shot_task` | 1 | Does a little work and returns, ending itself |
//!
//! ## Expected Behavior
//!
//! 1. SysTick preempts the running task every millisecond and the ready ring
//!    rotates.
//! 2. When the auditor contends for the ledger while the counter holds it,
//!    it yields; the counter's release hands the CPU straight back to the
//!    more urgent auditor, which always sees the two copies agree.
//! 3. The one-shot task returns into the exit trampoline; the kernel task
//!    frees its stack and control block shortly after.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use kestrel::semaphore::Semaphore;
use kestrel::system;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

static LEDGER_LOCK: Semaphore = Semaphore::new();

/// Both copies change together, under `LEDGER_LOCK`.
static LEDGER: AtomicU32 = AtomicU32::new(0);
static SHADOW: AtomicU32 = AtomicU32::new(0);

static AUDIT_FAILURES: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

extern "C" fn counter_task() {
    loop {
        system::acquire(&LEDGER_LOCK);
        let next = LEDGER.load(Ordering::Relaxed).wrapping_add(1);
        LEDGER.store(next, Ordering::Relaxed);
        // give the auditor a chance to contend mid-update
        system::yield_task();
        SHADOW.store(next, Ordering::Relaxed);
        system::release(&LEDGER_LOCK);
    }
}

extern "C" fn auditor_task() {
    loop {
        system::acquire(&LEDGER_LOCK);
        if LEDGER.load(Ordering::Relaxed) != SHADOW.load(Ordering::Relaxed) {
            AUDIT_FAILURES.fetch_add(1, Ordering::Relaxed);
        }
        system::release(&LEDGER_LOCK);
        system::yield_task();
    }
}

extern "C" fn scratch_task() {
    loop {
        // Exhaustion just skips a round
        if let Ok(buffer) = system::malloc(256) {
            // Safety: the block holds at least 256 bytes and is ours alone
            unsafe {
                core::ptr::write_bytes(buffer.as_ptr(), 0xA5, 256);
                system::free(buffer);
            }
        }
        system::yield_task();
    }
}

extern "C" fn one_shot_task() {
    let mut acc: u32 = 0;
    for i in 0..1000u32 {
        acc = acc.wrapping_mul(31).wrapping_add(i);
    }
    core::hint::black_box(acc);
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Boots the kernel, creates the demo tasks and starts
/// task switching. Does not return.
#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();

    system::init();

    system::new_task(counter_task, 3).expect("Failed to create counter_task");
    system::new_task(auditor_task, 5).expect("Failed to create auditor_task");
    system::new_task(scratch_task, 2).expect("Failed to create scratch_task");
    system::new_task(one_shot_task, 1).expect("Failed to create one_shot_task");

    system::start(cp)
}
