//! # Task Control Block
//!
//! Defines the task model for Kestrel. A task is a control block living in
//! the kernel pool plus a fixed-size stack living in the user pool.
//!
//! ## Lifecycle
//!
//! ```text
//!   create_task()        register_task()          end / remove_task()
//!  ─────────────► Created ───────────────► Ready ─────────────────────► Terminated
//!  (kmalloc ctrl,  (not in ring,            (in the ready ring,          (unlinked; memory
//!   malloc stack)   running = false)         running once switched to)    back via free_task)
//! ```
//!
//! There is no blocked state. A task contending for a semaphore stays in
//! the ready ring; the semaphore steers the scheduler around it instead.

use core::ptr::NonNull;

use crate::semaphore::Holdings;

/// Task entry point. Returning from it ends the task.
pub type TaskEntry = extern "C" fn();

/// Task priority. Numerically larger values are more urgent.
pub type Priority = u8;

// ---------------------------------------------------------------------------
// Task identity and state
// ---------------------------------------------------------------------------

/// Stable handle naming a node in the scheduler's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u16);

impl TaskId {
    /// Arena slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u16)
    }

    #[inline]
    pub(crate) const fn raw(self) -> u16 {
        self.0
    }
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Control block and stack exist; the task is not in the ready ring.
    Created,
    /// Member of the ready ring, running or waiting for its turn.
    Ready,
    /// Unlinked from the ring; its memory is returned by `free_task`.
    Terminated,
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// A task stack: `words` 32-bit words starting at `base`, growing down from
/// [`Stack::top`].
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u32>,
    words: usize,
}

impl Stack {
    /// # Safety
    /// `base` must point to `words` writable words owned by the new task.
    pub(crate) const unsafe fn from_raw(base: NonNull<u32>, words: usize) -> Self {
        Self { base, words }
    }

    /// Lowest address of the stack (what the MPU region is programmed with).
    #[inline]
    pub const fn base(&self) -> NonNull<u32> {
        self.base
    }

    #[inline]
    pub const fn words(&self) -> usize {
        self.words
    }

    /// Stack size in bytes.
    #[inline]
    pub const fn bytes(&self) -> usize {
        self.words * core::mem::size_of::<u32>()
    }

    /// One past the highest word; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u32 {
        self.base.as_ptr().wrapping_add(self.words)
    }

    /// Whether `sp` points into this stack (the top itself included).
    pub fn contains(&self, sp: *const u32) -> bool {
        let base = self.base.as_ptr() as usize;
        (base..=self.top() as usize).contains(&(sp as usize))
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
///
/// Owns the task's stack allocation. `stack_top` is the stack pointer the
/// trap layer saved when the task was last switched away from; it is only
/// meaningful once `running` is set.
pub struct TaskCtrl {
    stack: Stack,
    pub(crate) stack_top: *mut u32,
    priority: Priority,
    entry: TaskEntry,
    /// Start delay in ticks. Recorded for the scheduler, not yet acted upon.
    ticks_until_wake: u32,
    /// Set once a context has been synthesized on `stack`.
    pub(crate) running: bool,
    pub(crate) holdings: Holdings,
}

impl TaskCtrl {
    pub(crate) fn new(
        stack: Stack,
        entry: TaskEntry,
        priority: Priority,
        ticks_until_wake: u32,
    ) -> Self {
        let stack_top = stack.top();
        Self {
            stack,
            stack_top,
            priority,
            entry,
            ticks_until_wake,
            running: false,
            holdings: Holdings::new(),
        }
    }

    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    #[inline]
    pub fn stack_top(&self) -> *mut u32 {
        self.stack_top
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn entry(&self) -> TaskEntry {
        self.entry
    }

    #[inline]
    pub fn ticks_until_wake(&self) -> u32 {
        self.ticks_until_wake
    }

    /// Whether the task's context has ever been created.
    #[inline]
    pub fn has_run(&self) -> bool {
        self.running
    }
}

/// Owning handle to a control block in the kernel pool.
///
/// Produced by `create_task`. Ownership passes to the ready ring on
/// `register_task` and comes back out when the node is freed.
#[derive(Debug)]
pub struct TaskHandle(NonNull<TaskCtrl>);

impl TaskHandle {
    /// # Safety
    /// `ptr` must point to an initialized `TaskCtrl` that nothing else owns.
    #[inline]
    pub(crate) const unsafe fn from_raw(ptr: NonNull<TaskCtrl>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub(crate) fn into_raw(self) -> NonNull<TaskCtrl> {
        self.0
    }

    /// The control block behind this handle.
    #[inline]
    pub fn ctrl(&self) -> &TaskCtrl {
        // Safety: the handle owns the control block
        unsafe { self.0.as_ref() }
    }

    /// A handle held outside the ready ring names a task not yet registered.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::Created
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::STACK_WORDS;

    pub(crate) extern "C" fn nop_entry() {}

    /// Build a leaked control block with its own leaked stack.
    pub(crate) fn leaked_task(priority: Priority) -> TaskHandle {
        let words: &'static mut [u32] = vec![0u32; STACK_WORDS].leak();
        let base = NonNull::new(words.as_mut_ptr()).unwrap();
        let stack = unsafe { Stack::from_raw(base, STACK_WORDS) };
        let ctrl = Box::leak(Box::new(TaskCtrl::new(stack, nop_entry, priority, 0)));
        unsafe { TaskHandle::from_raw(NonNull::from(ctrl)) }
    }

    #[test]
    fn test_tcb_initialization() {
        let task = leaked_task(5);
        let ctrl = task.ctrl();

        assert_eq!(ctrl.priority(), 5);
        assert_eq!(ctrl.ticks_until_wake(), 0);
        assert!(!ctrl.has_run());
        assert_eq!(task.state(), TaskState::Created);
        assert_eq!(ctrl.stack_top(), ctrl.stack().top());
        assert_eq!(ctrl.entry() as usize, nop_entry as usize);
    }

    #[test]
    fn test_stack_bounds() {
        let task = leaked_task(1);
        let stack = task.ctrl().stack();

        assert_eq!(stack.words(), STACK_WORDS);
        assert_eq!(stack.bytes(), STACK_WORDS * 4);
        assert_eq!(
            stack.top() as usize - stack.base().as_ptr() as usize,
            stack.bytes()
        );
        assert!(stack.contains(stack.top()));
        assert!(stack.contains(stack.base().as_ptr()));
        assert!(!stack.contains(stack.top().wrapping_add(1)));
    }

    #[test]
    fn test_task_id_round_trip() {
        let id = TaskId::from_index(7);
        assert_eq!(id.index(), 7);
        assert_eq!(id.raw(), 7);
        assert!(TaskId::from_index(2) < id);
    }
}
