//! # Semaphore
//!
//! Binary semaphore with priority-aware hand-off. Waiters don't block: a
//! contending task stays in the ready ring and keeps retrying, while the
//! semaphore tells the scheduler who should run next so the holder gets to
//! finish its critical section.
//!
//! ## Policy
//!
//! | Event                               | Effect                                  |
//! |-------------------------------------|-----------------------------------------|
//! | acquire, lock free                  | caller becomes holder                   |
//! | acquire, holder at least as urgent  | caller recorded as waiter, swap to holder |
//! | acquire, holder less urgent         | caller recorded as waiter, plain yield  |
//! | release, waiter at least as urgent  | waiter nominated to run next            |
//!
//! A recorded waiter is only kept over a new contender when it is strictly
//! more urgent. The state machine here runs in trap context (under the
//! scheduler's critical section); `Kernel::acquire`/`Kernel::release` are the
//! task-side entry points.
//!
//! ## Ownership
//!
//! `held_by` and `waiting` are weak ids. Each task also keeps its own
//! [`Holdings`], so the kernel can drop both references when the task's
//! arena slot is freed, before the slot is handed to another task. A
//! semaphore must outlive every task that holds or waits on it.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::config::HELD_SEMAPHORES_MAX;
use crate::error::KernelError;
use crate::task::{Priority, TaskId};

const NO_TASK: u16 = u16::MAX;
const BOOT_HOLDER: u16 = u16::MAX - 1;

/// Who holds a locked semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// Granted outside any task: before switching started, or from an
    /// exception handler.
    Boot,
    Task(TaskId),
}

/// Why an acquire attempt did not succeed, and what the caller should do
/// before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Switch straight to the holder.
    SwapTo(TaskId),
    /// Give up the CPU to whoever is next in the ring.
    Yield,
}

pub struct Semaphore {
    lock: AtomicBool,
    held_by: AtomicU16,
    waiting: AtomicU16,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
            held_by: AtomicU16::new(NO_TASK),
            waiting: AtomicU16::new(NO_TASK),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire)
    }

    pub fn holder(&self) -> Option<Holder> {
        match self.held_by.load(Ordering::Relaxed) {
            NO_TASK => None,
            BOOT_HOLDER => Some(Holder::Boot),
            raw => Some(Holder::Task(TaskId::from_index(raw as usize))),
        }
    }

    pub fn waiter(&self) -> Option<TaskId> {
        decode(self.waiting.load(Ordering::Relaxed))
    }

    /// Atomic test-and-set. `true` if the lock was free and is now taken.
    #[inline]
    fn test_and_set(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Try to take the lock on behalf of `me`.
    ///
    /// `urgency` reports the priority of a task in the ready ring and `None`
    /// for anything that isn't.
    ///
    /// # Panics
    /// If the lock is taken but no holder was ever recorded.
    pub(crate) fn try_acquire(
        &self,
        me: TaskId,
        urgency: impl Fn(TaskId) -> Option<Priority>,
    ) -> Result<(), Contention> {
        if self.test_and_set() {
            self.held_by.store(me.raw(), Ordering::Relaxed);
            let _ = self.waiting.compare_exchange(
                me.raw(),
                NO_TASK,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            return Ok(());
        }

        let mine = urgency(me).unwrap_or(Priority::MIN);

        let keep_waiter = self
            .waiter()
            .and_then(&urgency)
            .is_some_and(|theirs| theirs > mine);
        if !keep_waiter {
            self.waiting.store(me.raw(), Ordering::Relaxed);
        }

        match self.holder() {
            None => panic!("{}", KernelError::InconsistentLockState),
            Some(Holder::Task(holder)) if holder != me => match urgency(holder) {
                Some(theirs) if theirs >= mine => Err(Contention::SwapTo(holder)),
                _ => Err(Contention::Yield),
            },
            Some(_) => Err(Contention::Yield),
        }
    }

    /// Release the lock held by `me` (`None` outside any task).
    ///
    /// Returns the waiter to hand the CPU to, if it is at least as urgent as
    /// the releaser. Releasing an unlocked semaphore only clears stale
    /// bookkeeping.
    pub(crate) fn release(
        &self,
        me: Option<TaskId>,
        urgency: impl Fn(TaskId) -> Option<Priority>,
    ) -> Option<TaskId> {
        if !self.is_locked() {
            self.clear();
            return None;
        }

        self.held_by.store(NO_TASK, Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);

        let waiter = self.waiter()?;
        let mine = me.and_then(&urgency).unwrap_or(Priority::MIN);
        match urgency(waiter) {
            Some(theirs) if theirs >= mine => {
                self.waiting.store(NO_TASK, Ordering::Relaxed);
                Some(waiter)
            }
            Some(_) => None,
            None => {
                // waiter left the ring
                self.waiting.store(NO_TASK, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take the lock unconditionally outside any task.
    pub(crate) fn grant(&self) {
        self.lock.store(true, Ordering::Release);
        self.held_by.store(BOOT_HOLDER, Ordering::Relaxed);
    }

    /// Unlock and forget the holder. A recorded waiter stays recorded.
    pub(crate) fn unlock(&self) {
        self.held_by.store(NO_TASK, Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
    }

    /// Unlock and forget both holder and waiter.
    pub(crate) fn clear(&self) {
        self.waiting.store(NO_TASK, Ordering::Relaxed);
        self.unlock();
    }

    /// Drop every reference to `id`: unlock if it holds the semaphore and
    /// forget it as the waiter. Returns whether the lock was released.
    pub(crate) fn abandon(&self, id: TaskId) -> bool {
        let _ = self
            .waiting
            .compare_exchange(id.raw(), NO_TASK, Ordering::Relaxed, Ordering::Relaxed);
        let held = self
            .held_by
            .compare_exchange(id.raw(), NO_TASK, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if held {
            self.lock.store(false, Ordering::Release);
        }
        held
    }
}

fn decode(raw: u16) -> Option<TaskId> {
    match raw {
        NO_TASK | BOOT_HOLDER => None,
        raw => Some(TaskId::from_index(raw as usize)),
    }
}

// ---------------------------------------------------------------------------
// Per-task bookkeeping
// ---------------------------------------------------------------------------

/// The semaphores one task holds, and the one it last failed to take.
/// Lives in the task's control block; only touched in trap context.
pub(crate) struct Holdings {
    held: [Option<NonNull<Semaphore>>; HELD_SEMAPHORES_MAX],
    waiting_on: Option<NonNull<Semaphore>>,
}

impl Holdings {
    pub(crate) const fn new() -> Self {
        Self {
            held: [None; HELD_SEMAPHORES_MAX],
            waiting_on: None,
        }
    }

    /// Record a won semaphore; the task no longer waits on anything.
    pub(crate) fn insert(&mut self, sem: &Semaphore) -> Result<(), KernelError> {
        self.waiting_on = None;
        let sem = NonNull::from(sem);
        if self.holds(sem) {
            return Ok(());
        }
        let slot = self
            .held
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(KernelError::TooManyHeld)?;
        *slot = Some(sem);
        Ok(())
    }

    pub(crate) fn remove(&mut self, sem: &Semaphore) {
        let sem = NonNull::from(sem);
        for slot in self.held.iter_mut().filter(|slot| **slot == Some(sem)) {
            *slot = None;
        }
    }

    pub(crate) fn holds(&self, sem: NonNull<Semaphore>) -> bool {
        self.held.contains(&Some(sem))
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.held.iter().flatten().count()
    }

    pub(crate) fn wait_on(&mut self, sem: &Semaphore) {
        self.waiting_on = Some(NonNull::from(sem));
    }

    #[inline]
    pub(crate) fn waiting_on(&self) -> Option<NonNull<Semaphore>> {
        self.waiting_on
    }

    /// Make every recorded semaphore forget `owner`, the task these holdings
    /// belong to. Returns how many locks were released.
    ///
    /// # Safety
    /// Every recorded semaphore must still be alive.
    pub(crate) unsafe fn abandon(&mut self, owner: TaskId) -> usize {
        let mut released = 0;
        for sem in self.held.iter_mut().filter_map(Option::take) {
            if sem.as_ref().abandon(owner) {
                released += 1;
            }
        }
        if let Some(sem) = self.waiting_on.take() {
            sem.as_ref().abandon(owner);
        }
        released
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
