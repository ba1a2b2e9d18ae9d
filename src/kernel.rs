//! # Kernel
//!
//! The kernel context: both heap pools, the scheduler and the switching
//! flag, owned by one [`Kernel`] value. The board port keeps a single
//! `static` instance (see `system`); the test suite builds as many as it
//! likes on top of the simulated port.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt)
//!   └─► main()
//!         ├─► init_heap()              ← hand both pools their regions
//!         ├─► spawn_system_tasks()     ← kernel task (reaper) + idle task
//!         ├─► new_task()               ← application tasks (×N)
//!         └─► start_task_switching()   ← activate the head task (no return)
//! ```
//!
//! ## Privilege
//!
//! Tasks run unprivileged and cannot mask interrupts, so they never touch
//! the scheduler directly. Every ring or semaphore operation made from a
//! task is a [`ServiceCall`]: the port traps into [`Kernel::service_call`],
//! which runs in handler mode at the same priority as the switch exception.
//! Calls made before switching starts, or from an exception handler, run
//! inline instead.

use core::cell::RefCell;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use log::{debug, trace, warn};

use crate::arch::Port;
use crate::buddy::{request_order, Buddy};
use crate::config::{
    IDLE_TASK_PRIORITY, KERNEL_MAX_ORDER, KERNEL_MIN_ORDER, KERNEL_TASK_PRIORITY, STACK_BYTES,
    STACK_WORDS, USER_MAX_ORDER, USER_MIN_ORDER,
};
use crate::error::{AllocError, KernelError};
use crate::heap::Pool;
use crate::scheduler::Scheduler;
use crate::semaphore::{Contention, Holder, Semaphore};
use crate::sync::{self, Mutex};
use crate::task::{Priority, Stack, TaskCtrl, TaskEntry, TaskHandle, TaskId, TaskState};

/// Result word of a service call that was refused.
const REJECTED: usize = usize::MAX;

/// `running` value while no task has been activated.
const NO_TASK: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Service calls
// ---------------------------------------------------------------------------

/// A request from task context into the privileged kernel.
///
/// On the board a call travels as `(number, argument)` in r0/r1 of an `svc`
/// instruction and comes back as a single result word in r0.
#[derive(Clone, Copy)]
pub enum ServiceCall<'a> {
    /// Give up the CPU.
    Yield,
    /// Unlink the caller and queue it for the reaper.
    EndTask,
    /// One acquire attempt. Result `1` if the caller now holds the lock.
    Acquire(&'a Semaphore),
    Release(&'a Semaphore),
    /// Append a created task to the ready ring. Result is the new `TaskId`,
    /// or `REJECTED` with ownership staying with the caller.
    Register(NonNull<TaskCtrl>),
    Remove(TaskId),
    /// Free an arena slot. Result is the task's control block, or `0`.
    Detach(TaskId),
    /// Free the slot of one retired task. Result as for `Detach`.
    Reap,
    CountTasks,
    TaskExists(TaskId),
}

impl ServiceCall<'_> {
    /// Encode as `(number, argument)`.
    pub fn into_raw(self) -> (u32, usize) {
        match self {
            Self::Yield => (0, 0),
            Self::EndTask => (1, 0),
            Self::Acquire(sem) => (2, sem as *const Semaphore as usize),
            Self::Release(sem) => (3, sem as *const Semaphore as usize),
            Self::Register(task) => (4, task.as_ptr() as usize),
            Self::Remove(id) => (5, id.index()),
            Self::Detach(id) => (6, id.index()),
            Self::Reap => (7, 0),
            Self::CountTasks => (8, 0),
            Self::TaskExists(id) => (9, id.index()),
        }
    }

    /// Decode a trapped `(number, argument)` pair.
    ///
    /// # Safety
    /// The pair must come from [`ServiceCall::into_raw`] on a call whose
    /// borrows outlive `'a`.
    pub unsafe fn from_raw<'a>(number: u32, arg: usize) -> Option<ServiceCall<'a>> {
        let call = match number {
            0 => ServiceCall::Yield,
            1 => ServiceCall::EndTask,
            2 => ServiceCall::Acquire(&*(arg as *const Semaphore)),
            3 => ServiceCall::Release(&*(arg as *const Semaphore)),
            4 => ServiceCall::Register(NonNull::new(arg as *mut TaskCtrl)?),
            5 => ServiceCall::Remove(TaskId::from_index(arg)),
            6 => ServiceCall::Detach(TaskId::from_index(arg)),
            7 => ServiceCall::Reap,
            8 => ServiceCall::CountTasks,
            9 => ServiceCall::TaskExists(TaskId::from_index(arg)),
            _ => return None,
        };
        Some(call)
    }
}

fn handle_into_word(task: TaskHandle) -> usize {
    task.into_raw().as_ptr() as usize
}

/// # Safety
/// `word` must be `0` or a control block a service call gave up.
unsafe fn handle_from_word(word: usize) -> Option<TaskHandle> {
    match NonNull::new(word as *mut TaskCtrl) {
        Some(ptr) => Some(TaskHandle::from_raw(ptr)),
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Kernel context
// ---------------------------------------------------------------------------

pub struct Kernel<P: Port> {
    port: P,
    user: Pool,
    kernel: Pool,
    sched: Mutex<RefCell<Scheduler>>,
    switching: AtomicBool,
    /// Task activated by the last switch, readable from thread mode.
    running: AtomicU16,
    ticks: AtomicU32,
}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            user: Pool::new("user", USER_MIN_ORDER, USER_MAX_ORDER),
            kernel: Pool::new("kernel", KERNEL_MIN_ORDER, KERNEL_MAX_ORDER),
            sched: Mutex::new(RefCell::new(Scheduler::new())),
            switching: AtomicBool::new(false),
            running: AtomicU16::new(NO_TASK),
            ticks: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Whether `start_task_switching` has run.
    #[inline]
    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::Acquire)
    }

    /// The task the last switch activated.
    pub fn current_task(&self) -> Option<TaskId> {
        match self.running.load(Ordering::Relaxed) {
            NO_TASK => None,
            raw => Some(TaskId::from_index(raw as usize)),
        }
    }

    /// Ticks counted since boot.
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn with_sched<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        sync::with_locked(&self.sched, f)
    }

    /// Task code, as opposed to boot code or an exception handler.
    fn in_task_context(&self) -> bool {
        self.is_switching() && !self.port.in_exception()
    }

    /// Run `call`, trapping first when called from a task.
    fn invoke(&self, call: ServiceCall<'_>) -> usize {
        if self.in_task_context() {
            P::supervisor_call(self, call)
        } else {
            self.service_call(call)
        }
    }

    fn pend_if_switching(&self) {
        if self.is_switching() {
            self.port.pend_switch();
        }
    }

    // -----------------------------------------------------------------------
    // Heap
    // -----------------------------------------------------------------------

    /// Hand both pools their regions.
    ///
    /// # Safety
    /// `user` must point to `2^USER_MAX_ORDER` and `kernel` to
    /// `2^KERNEL_MAX_ORDER` writable bytes, 8-byte aligned and used by
    /// nothing else. No task may be running yet.
    pub unsafe fn init_heap(&self, user: NonNull<u8>, kernel: NonNull<u8>) {
        self.user.buddy_mut().init(user);
        self.kernel.buddy_mut().init(kernel);
        debug!(
            "heap ready: user {} bytes, kernel {} bytes",
            self.user.capacity(),
            self.kernel.capacity()
        );
    }

    fn with_pool<R>(&self, pool: &Pool, f: impl FnOnce(&mut Buddy) -> R) -> R {
        self.acquire(pool.lock());
        // Safety: the pool's semaphore is held
        let result = f(unsafe { pool.buddy_mut() });
        self.release(pool.lock());
        result
    }

    fn allocate_from(&self, pool: &Pool, size: usize) -> Result<NonNull<u8>, AllocError> {
        let order = request_order(size);
        let result = self.with_pool(pool, |buddy| buddy.allocate(order));
        if let Err(err) = &result {
            warn!("{} pool: {} ({} bytes requested)", pool.name(), err, size);
        }
        result
    }

    /// Allocate `size` bytes from the user pool.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_from(&self.user, size)
    }

    /// # Safety
    /// `ptr` must come from [`Kernel::malloc`] and not have been freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.with_pool(&self.user, |buddy| buddy.free(ptr));
    }

    /// Allocate `size` bytes from the kernel pool.
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_from(&self.kernel, size)
    }

    /// # Safety
    /// `ptr` must come from [`Kernel::kmalloc`] and not have been freed.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        self.with_pool(&self.kernel, |buddy| buddy.free(ptr));
    }

    /// Free bytes left in the user pool.
    pub fn free_space(&self) -> usize {
        self.with_pool(&self.user, |buddy| buddy.free_bytes())
    }

    /// Free bytes left in the kernel pool.
    pub fn kernel_free_space(&self) -> usize {
        self.with_pool(&self.kernel, |buddy| buddy.free_bytes())
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Allocate a task: control block from the kernel pool, stack from the
    /// user pool. The task is not registered.
    ///
    /// # Returns
    /// - `Ok(handle)`: the task in the `Created` state
    /// - `Err(e)`: an allocation failed; nothing stays allocated
    pub fn create_task(
        &self,
        entry: TaskEntry,
        priority: Priority,
        ticks_until_wake: u32,
    ) -> Result<TaskHandle, AllocError> {
        let block = self.kmalloc(size_of::<TaskCtrl>())?;
        let stack = match self.malloc(STACK_BYTES) {
            Ok(stack) => stack,
            Err(err) => {
                // Safety: `block` was just allocated and is unused
                unsafe { self.kfree(block) };
                return Err(err);
            }
        };

        let ctrl = block.cast::<TaskCtrl>();
        // Safety: `block` is sized and word aligned for a `TaskCtrl`; the
        // stack block spans `STACK_WORDS` words owned by nobody else
        unsafe {
            let stack = Stack::from_raw(stack.cast(), STACK_WORDS);
            ctrl.as_ptr()
                .write(TaskCtrl::new(stack, entry, priority, ticks_until_wake));
            Ok(TaskHandle::from_raw(ctrl))
        }
    }

    /// Give a task's stack back to the user pool and its control block
    /// back to the kernel pool.
    pub fn destroy_task(&self, task: TaskHandle) {
        let ctrl = task.into_raw();
        // Safety: the handle owned both allocations, made by `create_task`
        unsafe {
            let stack = ctrl.as_ref().stack().base();
            self.free(stack.cast());
            self.kfree(ctrl.cast());
        }
    }

    /// Append a task to the tail of the ready ring.
    ///
    /// # Returns
    /// - `Ok(id)`: the task is `Ready`
    /// - `Err(task)`: the task table is full; the caller keeps the task
    pub fn register_task(&self, task: TaskHandle) -> Result<TaskId, TaskHandle> {
        let raw = task.into_raw();
        match self.invoke(ServiceCall::Register(raw)) {
            // Safety: the service refused and gave ownership back
            REJECTED => Err(unsafe { TaskHandle::from_raw(raw) }),
            index => {
                let id = TaskId::from_index(index);
                debug!("task {} registered", index);
                Ok(id)
            }
        }
    }

    /// Create and register a task in one step, undoing the allocation when
    /// the task table is full.
    pub fn new_task(&self, entry: TaskEntry, priority: Priority) -> Result<TaskId, KernelError> {
        let task = self.create_task(entry, priority, 0)?;
        self.register_task(task).map_err(|task| {
            warn!("task table full, dropping task of priority {}", priority);
            self.destroy_task(task);
            KernelError::TaskTableFull
        })
    }

    /// Create the built-in tasks: the kernel task, which should loop over
    /// [`Kernel::reap`], and the idle task, which keeps the ring non-empty.
    pub fn spawn_system_tasks(
        &self,
        kernel_task: TaskEntry,
        idle_task: TaskEntry,
    ) -> Result<(TaskId, TaskId), KernelError> {
        let reaper = self.new_task(kernel_task, KERNEL_TASK_PRIORITY)?;
        let idle = self.new_task(idle_task, IDLE_TASK_PRIORITY)?;
        Ok((reaper, idle))
    }

    /// Unlink a task from the ready ring. Its memory stays allocated until
    /// [`Kernel::free_task`].
    pub fn remove_task(&self, id: TaskId) -> Result<(), KernelError> {
        match self.invoke(ServiceCall::Remove(id)) {
            REJECTED => Err(KernelError::UnknownTask),
            _ => Ok(()),
        }
    }

    /// Release a task's arena slot, stack and control block.
    pub fn free_task(&self, id: TaskId) -> Result<(), KernelError> {
        if self.is_switching() && self.current_task() == Some(id) {
            return Err(KernelError::TaskRunning);
        }
        // Safety: a non-zero result is a control block the ring gave up
        let task = unsafe { handle_from_word(self.invoke(ServiceCall::Detach(id))) }
            .ok_or(KernelError::UnknownTask)?;
        self.destroy_task(task);
        debug!("task {} freed", id.index());
        Ok(())
    }

    /// End the calling task. Its memory is released later by [`Kernel::reap`].
    pub fn end_task(&self) {
        self.invoke(ServiceCall::EndTask);
    }

    /// Free every retired task. Returns how many were freed.
    ///
    /// Runs in task context, since it takes the pool semaphores.
    pub fn reap(&self) -> usize {
        let mut freed = 0;
        // Safety: a non-zero result is a control block the ring gave up
        while let Some(task) = unsafe { handle_from_word(self.invoke(ServiceCall::Reap)) } {
            self.destroy_task(task);
            freed += 1;
        }
        if freed > 0 {
            debug!("reaped {} tasks", freed);
        }
        freed
    }

    /// Number of tasks in the ready ring.
    pub fn num_tasks(&self) -> usize {
        self.invoke(ServiceCall::CountTasks)
    }

    /// Whether `id` names a task in the ready ring.
    pub fn task_exists(&self, id: TaskId) -> bool {
        self.invoke(ServiceCall::TaskExists(id)) != 0
    }

    /// Give up the CPU to the next task in the ring.
    pub fn yield_task(&self) {
        if self.in_task_context() {
            P::supervisor_call(self, ServiceCall::Yield);
        }
    }

    // -----------------------------------------------------------------------
    // Switching
    // -----------------------------------------------------------------------

    /// Count a tick and pend a round-robin switch. Called from the timer
    /// interrupt.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.pend_if_switching();
    }

    /// Pick the next task and return the stack pointer to resume it from.
    ///
    /// # Panics
    /// If the ready ring is empty.
    pub fn switch_task(&self) -> *mut u32 {
        match self.with_sched(|s| self.select(s)) {
            Ok(sp) => sp,
            Err(err) => panic!("{}", err),
        }
    }

    /// Store `saved` as the stack pointer of the task being switched away
    /// from, then [`switch_task`](Kernel::switch_task). Called by the
    /// switch exception.
    ///
    /// # Panics
    /// If `saved` lies outside the outgoing task's stack, or the ready ring
    /// is empty.
    pub fn context_switch(&self, saved: *mut u32) -> *mut u32 {
        if let Err(err) = self.with_sched(|s| save_context(s, saved)) {
            panic!("{}", err);
        }
        self.switch_task()
    }

    fn select(&self, s: &mut Scheduler) -> Result<*mut u32, KernelError> {
        let next = s.select_next()?;
        trace!("switch to task {}", next.index());
        Ok(self.activate(s, next))
    }

    fn activate(&self, s: &mut Scheduler, id: TaskId) -> *mut u32 {
        let Some(task) = s.task_mut(id) else {
            panic!("{}", KernelError::UnknownTask);
        };
        if !task.running {
            let (top, entry) = (task.stack().top(), task.entry());
            // Safety: the stack belongs to the task and holds no context yet
            task.stack_top = unsafe { self.port.init_stack(top, entry) };
            task.running = true;
            debug!("task {} context created", id.index());
        }
        self.running.store(id.raw(), Ordering::Relaxed);
        task.stack_top
    }

    /// Activate the head of the ring and mark switching as started. Returns
    /// the stack pointer holding the first task's context.
    ///
    /// # Panics
    /// If the ready ring is empty.
    pub fn prepare_first_task(&self) -> *mut u32 {
        let sp = match self.with_sched(|s| s.start().map(|first| self.activate(s, first))) {
            Ok(sp) => sp,
            Err(err) => panic!("{}", err),
        };
        self.switching.store(true, Ordering::Release);
        sp
    }

    /// Launch the first task. Never returns.
    pub fn start_task_switching(&self) -> ! {
        let sp = self.prepare_first_task();
        debug!("task switching started");
        // Safety: `sp` was produced by `init_stack` and traps are live
        unsafe { self.port.start_first_task(sp) }
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    /// Take `sem`, retrying until it is free.
    ///
    /// Before switching starts, and from exception handlers, the lock is
    /// granted immediately.
    pub fn acquire(&self, sem: &Semaphore) {
        if !self.in_task_context() {
            sem.grant();
            return;
        }
        while P::supervisor_call(self, ServiceCall::Acquire(sem)) == 0 {}
    }

    /// Release `sem`, handing the CPU to its waiter if the waiter is at
    /// least as urgent as the caller.
    pub fn release(&self, sem: &Semaphore) {
        if !self.in_task_context() {
            if sem.is_locked() {
                sem.unlock();
            } else {
                sem.clear();
            }
            return;
        }
        P::supervisor_call(self, ServiceCall::Release(sem));
    }

    // -----------------------------------------------------------------------
    // Privileged side
    // -----------------------------------------------------------------------

    /// Execute a service call. Called by the port's trap handler, or inline
    /// outside task context.
    pub fn service_call(&self, call: ServiceCall<'_>) -> usize {
        match call {
            ServiceCall::Yield => {
                self.pend_if_switching();
                0
            }
            ServiceCall::EndTask => {
                let ended = self.with_sched(|s| {
                    let cur = s.current()?;
                    s.remove(cur).ok()?;
                    s.retire(cur).ok()?;
                    Some(cur)
                });
                if let Some(id) = ended {
                    debug!("task {} ended", id.index());
                }
                self.pend_if_switching();
                0
            }
            ServiceCall::Acquire(sem) => self.service_acquire(sem),
            ServiceCall::Release(sem) => self.service_release(sem),
            ServiceCall::Register(raw) => {
                // Safety: `register_task` gave up its handle for this call
                let task = unsafe { TaskHandle::from_raw(raw) };
                match self.with_sched(|s| s.insert(task)) {
                    Ok(id) => id.index(),
                    Err(task) => {
                        // ownership returns to the caller through `raw`
                        let _ = task.into_raw();
                        REJECTED
                    }
                }
            }
            ServiceCall::Remove(id) => {
                let removed = self.with_sched(|s| {
                    s.remove(id)?;
                    Ok::<_, KernelError>(s.current() == Some(id))
                });
                match removed {
                    Ok(was_current) => {
                        if was_current {
                            self.pend_if_switching();
                        }
                        0
                    }
                    Err(_) => REJECTED,
                }
            }
            ServiceCall::Detach(id) => self
                .with_sched(|s| {
                    if s.current() == Some(id) && self.is_switching() {
                        return None;
                    }
                    release_slot(s, id)
                })
                .map_or(0, |freed| self.hand_back(freed)),
            ServiceCall::Reap => self
                .with_sched(|s| {
                    let id = s.take_retired()?;
                    if s.current() == Some(id) {
                        // still on its own stack; wait for the next switch
                        let _ = s.retire(id);
                        return None;
                    }
                    release_slot(s, id)
                })
                .map_or(0, |freed| self.hand_back(freed)),
            ServiceCall::CountTasks => self.with_sched(|s| s.len()),
            ServiceCall::TaskExists(id) => {
                usize::from(self.with_sched(|s| s.state(id)) == Some(TaskState::Ready))
            }
        }
    }

    fn hand_back(&self, (task, id, released): (TaskHandle, TaskId, usize)) -> usize {
        if released > 0 {
            debug!("task {} left {} semaphores locked; released", id.index(), released);
        }
        handle_into_word(task)
    }

    fn service_acquire(&self, sem: &Semaphore) -> usize {
        let outcome: Result<Result<(), Contention>, KernelError> = self.with_sched(|s| {
            let Some(me) = s.current() else {
                sem.grant();
                return Ok(Ok(()));
            };
            let attempt = sem.try_acquire(me, |id| s.priority(id));
            match attempt {
                Ok(()) => {
                    if let Some(task) = s.task_mut(me) {
                        task.holdings.insert(sem)?;
                    }
                }
                Err(contention) => {
                    check_deadlock(s, me, sem)?;
                    if let Some(task) = s.task_mut(me) {
                        task.holdings.wait_on(sem);
                    }
                    if let Contention::SwapTo(holder) = contention {
                        s.hand_off(holder);
                    }
                }
            }
            Ok(attempt)
        });

        match outcome {
            Ok(Ok(())) => 1,
            Ok(Err(contention)) => {
                trace!("semaphore contended: {:?}", contention);
                self.port.pend_switch();
                0
            }
            Err(err) => panic!("{}", err),
        }
    }

    fn service_release(&self, sem: &Semaphore) -> usize {
        let target = self.with_sched(|s| {
            if let Some(task) = s.current().and_then(|cur| s.task_mut(cur)) {
                task.holdings.remove(sem);
            }
            let target = sem.release(s.current(), |id| s.priority(id));
            if let Some(waiter) = target {
                s.hand_off(waiter);
            }
            target
        });

        if let Some(waiter) = target {
            trace!("semaphore handed off to task {}", waiter.index());
            self.port.pend_switch();
        }
        0
    }
}

/// Record where the outgoing task's context was saved.
fn save_context(s: &mut Scheduler, saved: *mut u32) -> Result<(), KernelError> {
    let Some(task) = s.current().and_then(|cur| s.task_mut(cur)) else {
        return Ok(());
    };
    if !task.stack().contains(saved) {
        return Err(KernelError::StackOverflow);
    }
    task.stack_top = saved;
    Ok(())
}

/// Free the arena slot of `id` once every semaphore has forgotten it, so
/// the next task in that slot inherits neither a lock nor a wait. Also
/// returns how many locks were released on the task's behalf.
fn release_slot(s: &mut Scheduler, id: TaskId) -> Option<(TaskHandle, TaskId, usize)> {
    // Safety: semaphores outlive the tasks that hold or wait on them
    let released = s
        .task_mut(id)
        .map_or(0, |task| unsafe { task.holdings.abandon(id) });
    let task = s.release(id).ok()?;
    Some((task, id, released))
}

/// Fails when the holder of `sem` waits on a semaphore that `me` holds.
fn check_deadlock(s: &Scheduler, me: TaskId, sem: &Semaphore) -> Result<(), KernelError> {
    let Some(Holder::Task(holder)) = sem.holder() else {
        return Ok(());
    };
    if holder == me {
        return Ok(());
    }
    let blocked_on = s.task(holder).and_then(|task| task.holdings.waiting_on());
    match (blocked_on, s.task(me)) {
        (Some(other), Some(task)) if task.holdings.holds(other) => Err(KernelError::Deadlock),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
