//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! context switching via PendSV, service calls via SVCall, the SysTick
//! preemption timer and the launch of the first task.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by boot code and exception handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV pushes R4–R11 below that frame, hands the
//! resulting stack pointer to [`Kernel::context_switch`] and unwinds the
//! context of whichever task comes back.
//!
//! ## Service Calls
//!
//! Tasks run unprivileged. `svc 0` with the call number in r0 and its
//! argument in r1 enters SVCall, which runs [`Kernel::service_call`] on the
//! board kernel and writes the result over the stacked r0. A switch pended
//! by the call tail-chains into PendSV before the task resumes.
//!
//! ## Interrupt Priorities
//!
//! SVCall, PendSV and SysTick all sit at 0xFF (lowest), so none of them
//! ever preempts another and the scheduler is never re-entered.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;

use super::frame::{self, PC_SLOT};
use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::{Kernel, ServiceCall};
use crate::system::KERNEL;
use crate::task::TaskEntry;

/// Result word for an undecodable service call.
const BAD_CALL: u32 = u32::MAX;

/// The Cortex-M4 port. Traps always reach the board kernel in
/// [`crate::system::KERNEL`].
pub struct CortexM4;

// ---------------------------------------------------------------------------
// Peripheral setup
// ---------------------------------------------------------------------------

/// Configure the SysTick timer to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Put SVCall, PendSV and SysTick at the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // Safety: the kernel makes no priority-based critical sections
    unsafe {
        scb.set_priority(SystemHandler::SVCall, 0xff);
        scb.set_priority(SystemHandler::PendSV, 0xff);
        scb.set_priority(SystemHandler::SysTick, 0xff);
    }
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

// Safety: SVCall and PendSV below route into the board kernel, both at the
// lowest priority.
unsafe impl Port for CortexM4 {
    unsafe fn init_stack(&self, top: *mut u32, entry: TaskEntry) -> *mut u32 {
        frame::write_initial(top, entry as usize, task_exit as usize)
    }

    fn supervisor_call(_kernel: &Kernel<Self>, call: ServiceCall<'_>) -> usize {
        let (number, arg) = call.into_raw();
        let result: u32;
        // Safety: SVCall only reads r0/r1 and writes the stacked r0
        unsafe {
            asm!(
                "svc 0",
                inout("r0") number => result,
                in("r1") arg as u32,
                options(nostack),
            );
        }
        result as usize
    }

    #[inline]
    fn pend_switch(&self) {
        SCB::set_pendsv();
    }

    #[inline]
    fn in_exception(&self) -> bool {
        let ipsr: u32;
        // Safety: reading IPSR is allowed at any privilege level
        unsafe { asm!("mrs {}, IPSR", out(reg) ipsr, options(nomem, nostack, preserves_flags)) };
        ipsr & 0x1ff != 0
    }

    /// Switch Thread mode to PSP, unwind the synthesized frame by hand and
    /// jump to the entry point unprivileged.
    unsafe fn start_first_task(&self, sp: *mut u32) -> ! {
        let entry = frame::branch_target(sp.add(PC_SLOT).read());
        asm!(
            "adds r0, #32",        // skip R4-R11
            "msr psp, r0",

            // Thread mode on PSP (CONTROL.SPSEL = 1), still privileged
            "movs r0, #2",
            "msr control, r0",
            "isb",

            // Pop the hardware frame manually since there is no exception to return from
            "pop {{r0-r3, r12}}",
            "pop {{r4}}",          // LR: task_exit
            "add sp, #8",          // PC and xPSR; the entry comes in r5
            "mov lr, r4",

            // cpsie is ignored once unprivileged, so it goes first
            "movs r4, #3",
            "cpsie i",
            "msr control, r4",
            "isb",
            "bx r5",
            in("r0") sp,
            in("r5") entry,
            options(noreturn),
        );
    }
}

/// Return address of every task entry point. Ends the task.
extern "C" fn task_exit() -> ! {
    KERNEL.end_task();
    // the end-task call switches away for good
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler, the context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Hand the updated PSP to the kernel, which stores it and selects the
///    next task
/// 3. Restore R4–R11 from the returned stack pointer and make it the PSP
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Called by the NVIC only.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",             // r0: saved PSP in, next PSP out
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",

        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym pendsv_switch,
    );
}

extern "C" fn pendsv_switch(saved: *mut u32) -> *mut u32 {
    KERNEL.context_switch(saved)
}

// ---------------------------------------------------------------------------
// SVCall handler (service calls)
// ---------------------------------------------------------------------------

/// SVCall exception handler. Passes the stacked frame of the calling task
/// to [`svc_dispatch`], which returns straight to the exception return.
///
/// # Safety
/// Called by the NVIC only.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "mrs r0, psp",
        "b {dispatch}",
        dispatch = sym svc_dispatch,
    );
}

/// # Safety
/// `frame` is the hardware frame stacked by an `svc` from task code.
unsafe extern "C" fn svc_dispatch(frame: *mut u32) {
    let number = frame.read();
    let arg = frame.add(1).read() as usize;

    let result = match ServiceCall::from_raw(number, arg) {
        Some(call) => KERNEL.service_call(call) as u32,
        None => BAD_CALL,
    };
    frame.write(result);
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler, the preemption tick. Counts the tick and
/// pends a round-robin switch.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    KERNEL.tick();
}
