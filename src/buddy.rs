//! # Buddy Allocator
//!
//! A binary buddy allocator over one statically reserved region. The region
//! starts life as a single free block of `max_order`; requests are served by
//! splitting larger blocks in half, and freed blocks are merged with their
//! buddy (the other half of the block they were split from) whenever the
//! buddy is free too.
//!
//! ## Free Lists
//!
//! Each order has its own singly linked stack of free blocks. The link lives
//! in a [`HeapNode`] header at the start of the free block, and names the
//! successor by its *block index* (offset from the region base in units of
//! the minimum block size), never by address.
//!
//! ```text
//!  lists[order]          block index       block index
//!  ┌──────────┐        ┌────────────┐     ┌────────────┐
//!  │  head ───┼──────► │ order next─┼───► │ order NIL  │
//!  └──────────┘        └────────────┘     └────────────┘
//! ```
//!
//! ## Allocated Blocks
//!
//! A block handed to a client keeps its order in the first byte of a
//! one-word header; the payload starts [`HEADER_SIZE`] bytes in. `free`
//! reads the order back from there.
//!
//! Buddies are computed from offsets relative to the region base, so the
//! region only has to be word aligned, not aligned to its own size.
//!
//! This layer does no locking and detects neither double frees nor use after
//! free. [`crate::heap::Pool`] wraps it with a semaphore.

use core::ptr::{self, NonNull};

use crate::config::HEADER_SIZE;
use crate::error::AllocError;

/// Largest order a pool may be configured with.
pub const ORDER_LIMIT: u8 = 27;

/// End-of-list marker for block-index chains.
const NIL: u32 = u32::MAX;

/// Header embedded at the start of every free block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    /// Block size exponent. Shares its position with the allocation header.
    order: u8,
    /// Block index of the next free block of the same order.
    next: u32,
}

/// One free block, as reported by [`Buddy::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    /// Byte offset of the block from the region base.
    pub offset: usize,
    /// Block size exponent.
    pub order: u8,
}

impl FreeBlock {
    /// Block size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        1 << self.order
    }
}

/// Smallest `order` such that `2^order >= size`.
///
/// Sizes that are not a power of two round up; `0` and `1` both map to 0.
pub const fn size_to_order(size: usize) -> u8 {
    if size <= 1 {
        0
    } else {
        (usize::BITS - (size - 1).leading_zeros()) as u8
    }
}

/// Order of the block needed to serve a `size`-byte payload, header included.
#[inline]
pub const fn request_order(size: usize) -> u8 {
    size_to_order(size.saturating_add(HEADER_SIZE))
}

/// Buddy pool state: bounds, region base and per-order free lists.
pub struct Buddy {
    min_order: u8,
    max_order: u8,
    base: *mut u8,
    lists: [u32; ORDER_LIMIT as usize + 1],
}

// Safety: the region behind `base` is owned by the pool; all access goes
// through `&mut self`.
unsafe impl Send for Buddy {}

impl Buddy {
    /// Create a pool with the given inclusive order bounds. The pool has no
    /// memory until [`Buddy::init`] is called; until then every allocation
    /// fails with `OutOfMemory`.
    pub const fn new(min_order: u8, max_order: u8) -> Self {
        assert!(min_order <= max_order && max_order <= ORDER_LIMIT);
        // A free block must hold its header and an allocated one a payload
        assert!(1usize << min_order > HEADER_SIZE);
        assert!(1usize << min_order >= core::mem::size_of::<HeapNode>());

        Self {
            min_order,
            max_order,
            base: ptr::null_mut(),
            lists: [NIL; ORDER_LIMIT as usize + 1],
        }
    }

    /// Hand the pool its region and turn it into a single free block of
    /// `max_order`. Any previous state is forgotten.
    ///
    /// # Safety
    /// `base` must point to `2^max_order` bytes of writable memory, aligned
    /// to at least 8 bytes, that nothing else uses for as long as the pool
    /// does.
    pub unsafe fn init(&mut self, base: NonNull<u8>) {
        debug_assert_eq!(base.as_ptr() as usize % 8, 0);

        self.base = base.as_ptr();
        self.lists = [NIL; ORDER_LIMIT as usize + 1];
        self.push(0, self.max_order);
    }

    #[inline]
    pub const fn min_order(&self) -> u8 {
        self.min_order
    }

    #[inline]
    pub const fn max_order(&self) -> u8 {
        self.max_order
    }

    /// Size of the managed region in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        1 << self.max_order
    }

    /// Whether [`Buddy::init`] has been called.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// Allocate a block of `2^order` bytes (header included) and return a
    /// pointer to its payload.
    ///
    /// Orders below `min_order` are rounded up. Orders above `max_order`
    /// fail with [`AllocError::OutOfRange`]; if no block of the order or any
    /// larger one is free, [`AllocError::OutOfMemory`]. A failed request
    /// leaves the pool untouched.
    pub fn allocate(&mut self, order: u8) -> Result<NonNull<u8>, AllocError> {
        let order = order.max(self.min_order);
        let max = self.max_order;
        if order > max {
            return Err(AllocError::OutOfRange { order, max });
        }

        let (index, mut have) = (order..=max)
            .find_map(|o| self.pop(o).map(|index| (index, o)))
            .ok_or(AllocError::OutOfMemory(order))?;

        // Keep the lower half, free the upper half, one level at a time
        while have > order {
            have -= 1;
            let upper = index + (1 << (have - self.min_order));
            self.push(upper, have);
        }

        unsafe {
            let block = self.block_ptr(index);
            block.write(order);
            Ok(NonNull::new_unchecked(block.add(HEADER_SIZE)))
        }
    }

    /// Return a payload pointer to the pool, merging with free buddies.
    ///
    /// # Safety
    /// `ptr` must have come from [`Buddy::allocate`] on this pool and must
    /// not have been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = ptr.as_ptr().sub(HEADER_SIZE);
        let order = block.read();
        let offset = block.offset_from(self.base) as usize;

        debug_assert!(order >= self.min_order && order <= self.max_order);
        debug_assert_eq!(offset % (1 << order), 0);

        self.merge((offset >> self.min_order) as u32, order);
    }

    /// Order of the block behind an allocated payload pointer.
    ///
    /// # Safety
    /// Same contract as [`Buddy::free`].
    pub unsafe fn order_of(&self, ptr: NonNull<u8>) -> u8 {
        ptr.as_ptr().sub(HEADER_SIZE).read()
    }

    /// Iterate over every free block, smallest order first.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            buddy: self,
            order: self.min_order,
            cursor: self.lists[self.min_order as usize],
        }
    }

    /// Total bytes held in free blocks.
    pub fn free_bytes(&self) -> usize {
        self.free_blocks().map(|b| b.size()).sum()
    }

    // -----------------------------------------------------------------------
    // Free-list plumbing
    // -----------------------------------------------------------------------

    /// Coalesce a block with its buddy for as long as the buddy is free at
    /// the same order, then push the result.
    fn merge(&mut self, mut index: u32, mut order: u8) {
        while order < self.max_order {
            let span = 1 << (order - self.min_order);
            let buddy = index ^ span;

            if !self.unlink(order, buddy) {
                // Buddy is allocated or split; the block may already be
                // listed if it was freed twice
                if !self.contains(order, index) {
                    self.push(index, order);
                }
                return;
            }

            self.unlink(order, index);
            index &= !span;
            order += 1;
        }

        if !self.contains(order, index) {
            self.push(index, order);
        }
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut u8 {
        self.base.wrapping_add((index as usize) << self.min_order)
    }

    #[inline]
    unsafe fn read(&self, index: u32) -> HeapNode {
        self.block_ptr(index).cast::<HeapNode>().read()
    }

    #[inline]
    unsafe fn write(&mut self, index: u32, node: HeapNode) {
        self.block_ptr(index).cast::<HeapNode>().write(node)
    }

    fn push(&mut self, index: u32, order: u8) {
        let next = self.lists[order as usize];
        unsafe { self.write(index, HeapNode { order, next }) };
        self.lists[order as usize] = index;
    }

    fn pop(&mut self, order: u8) -> Option<u32> {
        let head = self.lists[order as usize];
        if head == NIL {
            return None;
        }

        let node = unsafe { self.read(head) };
        debug_assert_eq!(node.order, order, "free list corrupted");
        self.lists[order as usize] = node.next;
        Some(head)
    }

    fn contains(&self, order: u8, index: u32) -> bool {
        let mut cursor = self.lists[order as usize];
        while cursor != NIL {
            if cursor == index {
                return true;
            }
            cursor = unsafe { self.read(cursor) }.next;
        }
        false
    }

    /// Remove `index` from the list of `order`. Returns `false` if it wasn't
    /// there.
    fn unlink(&mut self, order: u8, index: u32) -> bool {
        let mut prev = NIL;
        let mut cursor = self.lists[order as usize];

        while cursor != NIL {
            let node = unsafe { self.read(cursor) };
            if cursor == index {
                if prev == NIL {
                    self.lists[order as usize] = node.next;
                } else {
                    let mut before = unsafe { self.read(prev) };
                    before.next = node.next;
                    unsafe { self.write(prev, before) };
                }
                return true;
            }
            prev = cursor;
            cursor = node.next;
        }

        false
    }
}

/// Iterator over the free blocks of a [`Buddy`].
pub struct FreeBlocks<'a> {
    buddy: &'a Buddy,
    order: u8,
    cursor: u32,
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        loop {
            if self.cursor != NIL {
                let index = self.cursor;
                self.cursor = unsafe { self.buddy.read(index) }.next;
                return Some(FreeBlock {
                    offset: (index as usize) << self.buddy.min_order,
                    order: self.order,
                });
            }

            if self.order >= self.buddy.max_order {
                return None;
            }
            self.order += 1;
            self.cursor = self.buddy.lists[self.order as usize];
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    /// Leak an 8-byte aligned, zeroed region of `bytes` bytes.
    pub(crate) fn region(bytes: usize) -> NonNull<u8> {
        let words: &'static mut [u64] = vec![0u64; bytes.div_ceil(8)].leak();
        NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap()
    }

    fn pool(min: u8, max: u8) -> Buddy {
        let mut buddy = Buddy::new(min, max);
        unsafe { buddy.init(region(1 << max)) };
        buddy
    }

    fn offset_of(buddy: &Buddy, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - HEADER_SIZE - buddy.base as usize
    }

    /// Free and allocated blocks must tile the region exactly, and no two
    /// buddies may both be free at the same order.
    fn check_tiling(buddy: &Buddy, allocated: &[(usize, u8)]) {
        let free: Vec<FreeBlock> = buddy.free_blocks().collect();

        let mut spans: Vec<(usize, usize)> = free
            .iter()
            .map(|b| (b.offset, b.size()))
            .chain(allocated.iter().map(|&(offset, order)| (offset, 1 << order)))
            .collect();
        spans.sort_unstable();

        let mut end = 0;
        for &(offset, size) in &spans {
            assert_eq!(offset, end, "gap or overlap at offset {offset}: {spans:?}");
            assert_eq!(offset % size, 0, "misaligned block at {offset}");
            end = offset + size;
        }
        assert_eq!(end, buddy.capacity());

        for b in &free {
            if b.order < buddy.max_order() {
                let twin = FreeBlock { offset: b.offset ^ b.size(), order: b.order };
                assert!(!free.contains(&twin), "unmerged buddies {b:?} and {twin:?}");
            }
        }
    }

    #[test]
    fn test_init_is_one_max_block() {
        let buddy = pool(4, 10);
        let free: Vec<_> = buddy.free_blocks().collect();
        assert_eq!(free, [FreeBlock { offset: 0, order: 10 }]);
        assert_eq!(buddy.free_bytes(), 1024);
    }

    #[test]
    fn test_uninitialized_pool_has_no_memory() {
        let mut buddy = Buddy::new(4, 10);
        assert!(!buddy.is_initialized());
        assert_eq!(buddy.allocate(4), Err(AllocError::OutOfMemory(4)));
        assert_eq!(buddy.free_bytes(), 0);
    }

    #[test]
    fn test_split_leaves_one_block_per_level() {
        let mut buddy = pool(4, 10);
        let ptr = buddy.allocate(4).unwrap();

        assert_eq!(offset_of(&buddy, ptr), 0);
        let orders: Vec<u8> = buddy.free_blocks().map(|b| b.order).collect();
        assert_eq!(orders, [4, 5, 6, 7, 8, 9]);
        // Each upper half sits right after the kept lower half
        for b in buddy.free_blocks() {
            assert_eq!(b.offset, b.size());
        }
        check_tiling(&buddy, &[(0, 4)]);
    }

    #[test]
    fn test_order_rounds_up_to_min() {
        let mut buddy = pool(5, 8);
        let ptr = buddy.allocate(0).unwrap();
        assert_eq!(unsafe { buddy.order_of(ptr) }, 5);
    }

    #[test]
    fn test_exact_order_reuses_freed_block() {
        let mut buddy = pool(4, 10);
        let a = buddy.allocate(6).unwrap();
        let _b = buddy.allocate(6).unwrap();
        unsafe { buddy.free(a) };
        let c = buddy.allocate(6).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_free_merges_back_to_single_block() {
        let mut buddy = pool(4, 12);
        let ptrs: Vec<_> = (0..8).map(|_| buddy.allocate(5).unwrap()).collect();
        for ptr in ptrs.into_iter().rev() {
            unsafe { buddy.free(ptr) };
        }
        let free: Vec<_> = buddy.free_blocks().collect();
        assert_eq!(free, [FreeBlock { offset: 0, order: 12 }]);
    }

    #[test]
    fn test_merge_upper_half_first() {
        let mut buddy = pool(4, 6);
        let lower = buddy.allocate(5).unwrap();
        let upper = buddy.allocate(5).unwrap();
        assert_eq!(offset_of(&buddy, upper), 32);

        unsafe { buddy.free(upper) };
        check_tiling(&buddy, &[(0, 5)]);
        unsafe { buddy.free(lower) };

        let free: Vec<_> = buddy.free_blocks().collect();
        assert_eq!(free, [FreeBlock { offset: 0, order: 6 }]);
    }

    #[test]
    fn test_whole_pool_allocation_round_trip() {
        let mut buddy = pool(4, 8);
        let all = buddy.allocate(8).unwrap();
        assert_eq!(buddy.free_bytes(), 0);
        assert_eq!(buddy.allocate(4), Err(AllocError::OutOfMemory(4)));

        unsafe { buddy.free(all) };
        assert_eq!(buddy.free_bytes(), 256);
        assert!(buddy.allocate(8).is_ok());
    }

    #[test]
    fn test_out_of_range_leaves_pool_intact() {
        let mut buddy = pool(4, 10);
        let _a = buddy.allocate(7).unwrap();
        let before: Vec<_> = buddy.free_blocks().collect();

        assert_eq!(
            buddy.allocate(11),
            Err(AllocError::OutOfRange { order: 11, max: 10 })
        );
        let order = request_order(4096);
        assert_eq!(
            buddy.allocate(order),
            Err(AllocError::OutOfRange { order, max: 10 })
        );

        let after: Vec<_> = buddy.free_blocks().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_out_of_memory_leaves_pool_intact() {
        let mut buddy = pool(4, 8);
        let _a = buddy.allocate(7).unwrap();
        let _b = buddy.allocate(6).unwrap();
        let before = buddy.free_bytes();

        assert_eq!(buddy.allocate(7), Err(AllocError::OutOfMemory(7)));
        assert_eq!(buddy.free_bytes(), before);
    }

    #[test]
    fn test_region_need_not_be_self_aligned() {
        // 16-byte aligned but not 1 KiB aligned
        let raw = region(2048 + 16);
        let base = unsafe { NonNull::new_unchecked(raw.as_ptr().add(16)) };
        let mut buddy = Buddy::new(4, 10);
        unsafe { buddy.init(base) };

        let ptrs: Vec<_> = (0..4).map(|_| buddy.allocate(8).unwrap()).collect();
        for ptr in ptrs {
            unsafe { buddy.free(ptr) };
        }
        let free: Vec<_> = buddy.free_blocks().collect();
        assert_eq!(free, [FreeBlock { offset: 0, order: 10 }]);
    }

    #[test]
    fn test_payload_round_trip_preserves_free_bytes() {
        let mut buddy = pool(4, 12);
        let keep = buddy.allocate(request_order(100)).unwrap();
        let before = buddy.free_bytes();

        let ptr = buddy.allocate(request_order(300)).unwrap();
        let order = unsafe { buddy.order_of(ptr) };
        unsafe {
            ptr.as_ptr().write_bytes(0xA5, 300);
            buddy.free(ptr);
        }
        assert_eq!(buddy.free_bytes(), before);

        let again = buddy.allocate(request_order(300)).unwrap();
        assert!(unsafe { buddy.order_of(again) } >= order);
        assert_eq!(unsafe { buddy.order_of(keep) }, 7);
    }

    #[test]
    fn test_size_to_order_table() {
        let cases = [(0, 0), (1, 0), (2, 1), (3, 2), (4, 2), (5, 3), (16, 4), (17, 5), (1024, 10)];
        for (size, order) in cases {
            assert_eq!(size_to_order(size), order, "size {size}");
        }
        assert_eq!(request_order(12), size_to_order(12 + HEADER_SIZE));
    }

    #[quickcheck]
    fn size_to_order_is_minimal(size: usize) -> bool {
        let size = size >> 1; // keep 2^order representable
        let order = size_to_order(size) as u32;
        let fits = 1usize << order >= size;
        let minimal = order == 0 || 1usize << (order - 1) < size;
        fits && minimal
    }

    #[quickcheck]
    fn size_to_order_is_idempotent(size: u32) -> bool {
        let order = size_to_order(size as usize);
        size_to_order(1usize << order) == order
    }

    /// Allocate when `op.0` is true, otherwise free the `op.1`-th live block.
    #[quickcheck]
    fn tiling_holds_over_any_sequence(ops: Vec<(bool, u16)>) {
        let mut buddy = pool(4, 12);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for (alloc, n) in ops {
            if alloc || live.is_empty() {
                let size = (n % 1500) as usize;
                match buddy.allocate(request_order(size)) {
                    Ok(ptr) => {
                        let order = unsafe { buddy.order_of(ptr) };
                        live.push((ptr, offset_of(&buddy, ptr), order));
                    }
                    Err(AllocError::OutOfMemory(_)) => {}
                    Err(e) => panic!("unexpected {e}"),
                }
            } else {
                let (ptr, _, _) = live.swap_remove(n as usize % live.len());
                unsafe { buddy.free(ptr) };
            }

            let allocated: Vec<_> = live.iter().map(|&(_, off, order)| (off, order)).collect();
            check_tiling(&buddy, &allocated);
        }

        for (ptr, _, _) in live {
            unsafe { buddy.free(ptr) };
        }
        assert_eq!(buddy.free_bytes(), buddy.capacity());
    }
}
