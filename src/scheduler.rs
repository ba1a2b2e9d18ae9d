//! # Scheduler
//!
//! The ready ring: a doubly linked list of registered tasks, scanned in
//! insertion order. Every switch advances to the successor of the current
//! task, wrapping to the head, unless a semaphore has nominated a hand-off
//! target, which then runs next regardless of its place in the ring.
//!
//! ## Storage
//!
//! Nodes live in a fixed arena of `MAX_TASKS` slots and link to each other
//! by [`TaskId`]. Unlinking a node leaves its slot (and its `next` link)
//! in place, so the task being removed while it runs still knows where the
//! round robin resumes. The slot is released afterwards by `release`.
//!
//! ```text
//!   head                               tail
//!    │                                  │
//!    ▼                                  ▼
//!  ┌────┐ next ┌────┐ next ┌────┐ next ┌────┐
//!  │ t0 │─────►│ t2 │─────►│ t5 │─────►│ t1 │──► (wraps to head)
//!  └────┘◄─────└────┘◄─────└────┘◄─────└────┘
//!        prev        prev        prev
//! ```
//!
//! Tasks that ended are parked on a retired list until the kernel task frees
//! their memory from thread context.

use core::ptr::NonNull;

use crate::config::MAX_TASKS;
use crate::error::KernelError;
use crate::task::{Priority, TaskCtrl, TaskHandle, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Arena node
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Node {
    task: NonNull<TaskCtrl>,
    prev: Option<TaskId>,
    next: Option<TaskId>,
    /// Member of the ready ring.
    linked: bool,
    /// Next entry on the retired list.
    retired_next: Option<TaskId>,
    retired: bool,
}

const EMPTY_SLOT: Option<Node> = None;

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Scheduler state. Lives inside the kernel's critical-section mutex; every
/// method assumes the caller is in a critical section.
pub struct Scheduler {
    nodes: [Option<Node>; MAX_TASKS],
    head: Option<TaskId>,
    tail: Option<TaskId>,

    /// Task selected by the last switch.
    current: Option<TaskId>,

    /// Nominated by a semaphore; consumed by the next switch.
    hand_off: Option<TaskId>,

    /// Head of the retired list.
    retired: Option<TaskId>,
}

// Safety: the control blocks behind the arena are owned by the scheduler and
// only touched under its critical-section mutex.
unsafe impl Send for Scheduler {}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            nodes: [EMPTY_SLOT; MAX_TASKS],
            head: None,
            tail: None,
            current: None,
            hand_off: None,
            retired: None,
        }
    }

    // -----------------------------------------------------------------------
    // Ring membership
    // -----------------------------------------------------------------------

    /// Append a task to the tail of the ready ring.
    ///
    /// # Returns
    /// - `Ok(id)`: the arena slot now owning the task
    /// - `Err(task)`: the arena is full; ownership goes back to the caller
    pub fn insert(&mut self, task: TaskHandle) -> Result<TaskId, TaskHandle> {
        let Some(index) = self.nodes.iter().position(Option::is_none) else {
            return Err(task);
        };
        let id = TaskId::from_index(index);

        self.nodes[index] = Some(Node {
            task: task.into_raw(),
            prev: self.tail,
            next: None,
            linked: true,
            retired_next: None,
            retired: false,
        });

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        Ok(id)
    }

    /// Unlink a task from the ready ring. Removing a task that is already
    /// unlinked is a no-op.
    ///
    /// The node keeps its own `next` link, so if `id` is the running task the
    /// next switch resumes the round robin after it.
    pub fn remove(&mut self, id: TaskId) -> Result<(), KernelError> {
        let node = *self.slot(id).ok_or(KernelError::UnknownTask)?;
        if !node.linked {
            return Ok(());
        }

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        let node = self.node_mut(id);
        node.linked = false;
        node.prev = None;

        if self.hand_off == Some(id) {
            self.hand_off = None;
        }
        Ok(())
    }

    /// Free the arena slot of `id` and hand back ownership of its task.
    /// Unlinks the task first if it is still in the ring.
    pub fn release(&mut self, id: TaskId) -> Result<TaskHandle, KernelError> {
        self.remove(id)?;
        if self.node_mut(id).retired {
            self.unretire(id);
        }

        let node = self.nodes[id.index()].take().ok_or(KernelError::UnknownTask)?;
        if self.current == Some(id) {
            self.current = None;
        }
        // Safety: the node owned the control block since `insert`
        Ok(unsafe { TaskHandle::from_raw(node.task) })
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Make the head of the ring current. Used once, to start switching.
    pub fn start(&mut self) -> Result<TaskId, KernelError> {
        let head = self.head.ok_or(KernelError::EmptyReadyRing)?;
        self.current = Some(head);
        Ok(head)
    }

    /// Pick the task to run next and make it current.
    ///
    /// A pending hand-off wins if its target is still in the ring. Otherwise
    /// the successor of the current task runs, wrapping to the head; a ring
    /// of one re-selects its only task.
    pub fn select_next(&mut self) -> Result<TaskId, KernelError> {
        let head = self.head.ok_or(KernelError::EmptyReadyRing)?;

        let next = match self.hand_off.take() {
            Some(target) if self.is_ready(target) => target,
            _ => self
                .current
                .and_then(|cur| self.slot(cur))
                .and_then(|node| node.next)
                .filter(|&id| self.is_ready(id))
                .unwrap_or(head),
        };

        self.current = Some(next);
        Ok(next)
    }

    /// Nominate `id` to run at the next switch.
    pub fn hand_off(&mut self, id: TaskId) {
        self.hand_off = Some(id);
    }

    #[inline]
    pub fn pending_hand_off(&self) -> Option<TaskId> {
        self.hand_off
    }

    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether `id` is a member of the ready ring.
    pub fn is_ready(&self, id: TaskId) -> bool {
        self.slot(id).is_some_and(|node| node.linked)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.slot(id).map(|node| {
            if node.linked {
                TaskState::Ready
            } else {
                TaskState::Terminated
            }
        })
    }

    /// Priority of a task in the ready ring; `None` for anything else.
    pub fn priority(&self, id: TaskId) -> Option<Priority> {
        self.slot(id)
            .filter(|node| node.linked)
            // Safety: the node owns a live control block
            .map(|node| unsafe { node.task.as_ref() }.priority())
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskCtrl> {
        // Safety: the node owns a live control block
        self.slot(id).map(|node| unsafe { node.task.as_ref() })
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskCtrl> {
        let mut task = self.slot(id)?.task;
        // Safety: the node owns the control block and `&mut self` is unique
        Some(unsafe { task.as_mut() })
    }

    /// Number of tasks in the ready ring.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Ready tasks in ring order, starting at the head.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        core::iter::successors(self.head, move |&id| self.slot(id).and_then(|node| node.next))
    }

    // -----------------------------------------------------------------------
    // Retired list
    // -----------------------------------------------------------------------

    /// Queue an unlinked task for the reaper.
    pub fn retire(&mut self, id: TaskId) -> Result<(), KernelError> {
        let head = self.retired;
        let node = self.slot_mut(id).ok_or(KernelError::UnknownTask)?;
        if node.retired {
            return Ok(());
        }
        node.retired = true;
        node.retired_next = head;
        self.retired = Some(id);
        Ok(())
    }

    /// Pop a retired task, if any.
    pub fn take_retired(&mut self) -> Option<TaskId> {
        let id = self.retired?;
        let node = self.node_mut(id);
        let next = node.retired_next.take();
        node.retired = false;
        self.retired = next;
        Some(id)
    }

    fn unretire(&mut self, id: TaskId) {
        let next = self.node_mut(id).retired_next.take();
        self.node_mut(id).retired = false;

        if self.retired == Some(id) {
            self.retired = next;
            return;
        }
        let mut cursor = self.retired;
        while let Some(at) = cursor {
            let node = self.node_mut(at);
            if node.retired_next == Some(id) {
                node.retired_next = next;
                return;
            }
            cursor = node.retired_next;
        }
    }

    // -----------------------------------------------------------------------
    // Arena access
    // -----------------------------------------------------------------------

    fn slot(&self, id: TaskId) -> Option<&Node> {
        self.nodes.get(id.index())?.as_ref()
    }

    fn slot_mut(&mut self, id: TaskId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())?.as_mut()
    }

    /// Node behind a link. Links only ever name occupied slots.
    fn node_mut(&mut self, id: TaskId) -> &mut Node {
        match self.slot_mut(id) {
            Some(node) => node,
            None => panic!("dangling ready-ring link to slot {}", id.index()),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
