//! # Heap Pools
//!
//! A [`Pool`] is a buddy allocator guarded by its own [`Semaphore`]. The
//! kernel owns two of them: the user pool (task stacks, `malloc`) and the
//! kernel pool (control blocks, `kmalloc`). Each pool manages one region
//! reserved at boot, usually a [`HeapArea`] static. Buddies are found
//! relative to the region base, so the region needs no alignment beyond
//! its blocks' headers.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::buddy::Buddy;
use crate::semaphore::Semaphore;

pub struct Pool {
    name: &'static str,
    lock: Semaphore,
    buddy: UnsafeCell<Buddy>,
}

// Safety: the buddy state is only reached through `buddy_mut`, whose callers
// hold `lock`.
unsafe impl Sync for Pool {}

impl Pool {
    pub const fn new(name: &'static str, min_order: u8, max_order: u8) -> Self {
        Self {
            name,
            lock: Semaphore::new(),
            buddy: UnsafeCell::new(Buddy::new(min_order, max_order)),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Semaphore serializing access to this pool.
    #[inline]
    pub fn lock(&self) -> &Semaphore {
        &self.lock
    }

    /// Bytes spanned by the pool's region.
    pub fn capacity(&self) -> usize {
        // Safety: the orders are fixed at construction
        unsafe { (*self.buddy.get()).capacity() }
    }

    /// # Safety
    /// The caller holds `lock`, or runs before any task does.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn buddy_mut(&self) -> &mut Buddy {
        &mut *self.buddy.get()
    }
}

// ---------------------------------------------------------------------------
// Static heap regions
// ---------------------------------------------------------------------------

/// Backing storage for a pool, `N` bytes aligned for any block header.
///
/// Buddies are computed relative to the start of the region, so only the
/// header alignment matters, not alignment to `N`.
#[repr(C, align(16))]
pub struct HeapArea<const N: usize>(UnsafeCell<MaybeUninit<[u8; N]>>);

// Safety: the area is handed to exactly one pool at boot and only touched by
// that pool afterwards.
unsafe impl<const N: usize> Sync for HeapArea<N> {}

impl<const N: usize> Default for HeapArea<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HeapArea<N> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }

    /// Start of the region.
    pub fn base(&self) -> NonNull<u8> {
        // Safety: `UnsafeCell::get` never returns null
        unsafe { NonNull::new_unchecked(self.0.get().cast::<u8>()) }
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::request_order;
    use crate::config::HEADER_SIZE;

    #[test]
    fn test_heap_area_alignment() {
        let area = Box::leak(Box::new(HeapArea::<4096>::new()));
        assert_eq!(area.base().as_ptr() as usize % 16, 0);
        assert_eq!(area.len(), 4096);
    }

    #[test]
    fn test_pool_over_heap_area() {
        let area = Box::leak(Box::new(HeapArea::<1024>::new()));
        let pool = Pool::new("test", 4, 10);
        assert_eq!(pool.name(), "test");
        assert_eq!(pool.capacity(), 1024);

        let buddy = unsafe {
            pool.buddy_mut().init(area.base());
            pool.buddy_mut()
        };
        let p = buddy.allocate(request_order(100)).unwrap();
        assert_eq!(p.as_ptr() as usize - area.base().as_ptr() as usize, HEADER_SIZE);
        assert_eq!(buddy.free_bytes(), 1024 - 128);
        unsafe { buddy.free(p) };
        assert_eq!(buddy.free_bytes(), 1024);
    }
}
