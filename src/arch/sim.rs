//! # Simulated Port
//!
//! Host-side [`Port`] for the unit tests. There is no real second stack to
//! switch to, so a test plays the other tasks itself: it queues steps with
//! [`SimPort::then`], and whenever a service call pends a switch the next
//! step runs before the call returns, the way PendSV tail-chains after an
//! SVC on the board. A step usually starts with [`preempt`] to make the
//! kernel pick the task it stands for.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use super::Port;
use crate::buddy::tests::region;
use crate::config::{KERNEL_MAX_ORDER, USER_MAX_ORDER};
use crate::kernel::{Kernel, ServiceCall};
use crate::task::{TaskEntry, TaskId};

/// Words of the fake initial frame.
const FRAME_WORDS: usize = 2;

/// First word of every fake initial frame.
pub(crate) const FRAME_TAG: u32 = 0x5EED_F4A3;

/// Pended switches in a row with no step left to run before the simulation
/// gives up.
const DEADLOCK_LIMIT: usize = 64;

type Step = Box<dyn FnOnce()>;

pub(crate) struct SimPort {
    exception: Cell<bool>,
    pended: Cell<bool>,
    steps: RefCell<VecDeque<Step>>,
    active_sp: Cell<*mut u32>,
    frames_built: Cell<usize>,
    service_calls: Cell<usize>,
    idle_pends: Cell<usize>,
}

// Safety: trap delivery is synchronous on the host; `service_call` runs with
// the exception flag raised and steps run outside of it.
unsafe impl Port for SimPort {
    unsafe fn init_stack(&self, top: *mut u32, entry: TaskEntry) -> *mut u32 {
        let frame = top.sub(FRAME_WORDS);
        frame.write(FRAME_TAG);
        frame.add(1).write(entry as usize as u32);
        self.frames_built.set(self.frames_built.get() + 1);
        frame
    }

    fn supervisor_call(kernel: &Kernel<Self>, call: ServiceCall<'_>) -> usize {
        let port = kernel.port();
        port.service_calls.set(port.service_calls.get() + 1);

        let outer = port.exception.replace(true);
        let result = kernel.service_call(call);
        port.exception.set(outer);

        if port.pended.replace(false) {
            port.run_next_step();
        }
        result
    }

    fn pend_switch(&self) {
        self.pended.set(true);
    }

    fn in_exception(&self) -> bool {
        self.exception.get()
    }

    unsafe fn start_first_task(&self, _sp: *mut u32) -> ! {
        panic!("the simulated port has no first task to jump to");
    }
}

impl SimPort {
    pub(crate) fn new() -> Self {
        Self {
            exception: Cell::new(false),
            pended: Cell::new(false),
            steps: RefCell::new(VecDeque::new()),
            active_sp: Cell::new(std::ptr::null_mut()),
            frames_built: Cell::new(0),
            service_calls: Cell::new(0),
            idle_pends: Cell::new(0),
        }
    }

    /// Queue what the other tasks do at the next pended switch.
    pub(crate) fn then(&self, step: impl FnOnce() + 'static) {
        self.steps.borrow_mut().push_back(Box::new(step));
    }

    pub(crate) fn steps_left(&self) -> usize {
        self.steps.borrow().len()
    }

    /// Whether a switch was pended since the last call, clearing the flag.
    pub(crate) fn take_pended(&self) -> bool {
        self.pended.replace(false)
    }

    pub(crate) fn set_exception(&self, in_exception: bool) {
        self.exception.set(in_exception);
    }

    pub(crate) fn frames_built(&self) -> usize {
        self.frames_built.get()
    }

    pub(crate) fn service_calls(&self) -> usize {
        self.service_calls.get()
    }

    /// Stack pointer of the task the last switch activated.
    pub(crate) fn active_sp(&self) -> *mut u32 {
        self.active_sp.get()
    }

    fn run_next_step(&self) {
        let step = self.steps.borrow_mut().pop_front();
        match step {
            Some(step) => {
                self.idle_pends.set(0);
                step();
            }
            None => {
                let idle = self.idle_pends.get() + 1;
                self.idle_pends.set(idle);
                assert!(idle < DEADLOCK_LIMIT, "simulated tasks deadlocked");
            }
        }
    }
}

/// A kernel over fresh heap regions, leaked so steps can borrow it.
pub(crate) fn boot_kernel() -> &'static Kernel<SimPort> {
    let _ = env_logger::builder().is_test(true).try_init();

    let kernel: &'static Kernel<SimPort> = Box::leak(Box::new(Kernel::new(SimPort::new())));
    // Safety: both regions are leaked and exclusively owned by the kernel
    unsafe {
        kernel.init_heap(
            region(1 << USER_MAX_ORDER),
            region(1 << KERNEL_MAX_ORDER),
        )
    };
    kernel
}

/// Start switching and return the first task.
pub(crate) fn start(kernel: &Kernel<SimPort>) -> TaskId {
    let sp = kernel.prepare_first_task();
    kernel.port().active_sp.set(sp);
    active(kernel)
}

/// Run the switch exception: save the active stack pointer, pick the next
/// task, and return it.
pub(crate) fn preempt(kernel: &Kernel<SimPort>) -> TaskId {
    let port = kernel.port();
    let outer = port.exception.replace(true);
    let sp = kernel.context_switch(port.active_sp.get());
    port.exception.set(outer);
    port.active_sp.set(sp);
    active(kernel)
}

fn active(kernel: &Kernel<SimPort>) -> TaskId {
    match kernel.current_task() {
        Some(id) => id,
        None => panic!("no task was activated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::nop_entry;

    #[test]
    fn test_fake_frame_layout() {
        let port = SimPort::new();
        let stack = region(64).cast::<u32>();
        let top = unsafe { stack.as_ptr().add(16) };

        let sp = unsafe { port.init_stack(top, nop_entry) };
        assert_eq!(sp, unsafe { top.sub(FRAME_WORDS) });
        assert_eq!(unsafe { sp.read() }, FRAME_TAG);
        assert_eq!(unsafe { sp.add(1).read() }, nop_entry as usize as u32);
        assert_eq!(port.frames_built(), 1);
    }

    #[test]
    fn test_steps_run_in_order_on_pend() {
        let k = boot_kernel();
        k.new_task(nop_entry, 1).unwrap();
        start(k);

        let order = std::rc::Rc::new(RefCell::new(Vec::new()));
        for n in 0..2 {
            let order = order.clone();
            k.port().then(move || order.borrow_mut().push(n));
        }

        k.yield_task();
        k.yield_task();
        assert_eq!(*order.borrow(), vec![0, 1]);
        assert_eq!(k.port().steps_left(), 0);
    }
}
