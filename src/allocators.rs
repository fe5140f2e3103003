//! The allocator itself.
//!
//! ## [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap and freed memory
//! manager. It owns a [`HeapGrower`](../grower/trait.HeapGrower.html) and the
//! [`SegList`](../seglist/struct.SegList.html) of free blocks, and offers the
//! four classic entry points: `malloc`, `free`, `realloc` and `calloc`.
//!
//! The heap it manages looks like this:
//!
//! ```text
//!  heap_lo                                     first
//!    |        <------- prologue ------->        |                   epilogue
//!    v                                          v                      v
//!     -------------------------------------------------------------------
//!    | padding | header 16/a | footer 16/a | blocks ...          | 0/a |
//!     -------------------------------------------------------------------
//! ```
//!
//! The prologue and the epilogue are permanently allocated, so coalescing
//! never has to special-case either end of the heap. Whenever the heap grows,
//! the old epilogue header becomes the header of a new free block and a new
//! epilogue is written at the new top.

use core::cmp;
use core::ptr::{self, NonNull};

use crate::block::{align_up, Block, FreeBlock, ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD, WORD_SIZE};
use crate::grower::HeapGrower;
use crate::seglist::{class_of, SegList, CLASSES};

/// Default number of bytes to grow the heap by when nothing fits.
pub const CHUNK_SIZE: usize = 4096;

/// Bytes laid down at initialization: padding, prologue header and footer,
/// epilogue header.
const INITIAL_SIZE: usize = 4 * WORD_SIZE;

/// Block size needed to serve a request of `size` bytes.
fn block_size(size: usize) -> Option<usize> {
    align_up(size.checked_add(OVERHEAD)?)
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct RawAlloc<G> {
    pub grower: G,
    pub buckets: SegList,
    /// The first block after the prologue.
    first: Block,
    chunk_size: usize,
}

/// An iterator over every block between the prologue and the epilogue, in
/// address order.
pub struct HeapWalk {
    next: Block,
}

impl Iterator for HeapWalk {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next;
        if block.size() == 0 {
            return None;
        }
        self.next = block.next();
        Some(block)
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`, laying down the prologue and epilogue and
    /// growing the heap by [`CHUNK_SIZE`].
    pub fn new(grower: G) -> Result<Self, G::Err> {
        RawAlloc::with_chunk_size(grower, CHUNK_SIZE)
    }

    /// Create a new `RawAlloc` that grows the heap by at least `chunk_size`
    /// bytes at a time.
    pub fn with_chunk_size(mut grower: G, chunk_size: usize) -> Result<Self, G::Err> {
        let chunk_size = align_up(chunk_size)
            .unwrap_or(usize::MAX & !(ALIGNMENT - 1))
            .max(MIN_BLOCK_SIZE);

        let first = unsafe {
            let base = grower.grow_heap(INITIAL_SIZE)?;
            debug_assert_eq!(base.as_ptr() as usize % ALIGNMENT, 0);
            // The prologue's payload is the 16 bytes after the padding word,
            // exactly covering its own header and footer.
            let prologue = Block::from_payload(NonNull::new_unchecked(
                base.as_ptr().add(2 * WORD_SIZE),
            ));
            prologue.format_allocated(ALIGNMENT, true);
            base.as_ptr().write_bytes(0, WORD_SIZE);
            prologue.next().format_epilogue(true)
        };

        let mut alloc = RawAlloc {
            grower,
            buckets: SegList::new(),
            first,
            chunk_size,
        };

        unsafe {
            alloc.try_extend_heap(chunk_size)?;
        }
        alloc.debug_check(line!());
        Ok(alloc)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The first block after the prologue; the epilogue if the heap is empty.
    pub fn first_block(&self) -> Block {
        self.first
    }

    /// Walk every block in the heap, in address order.
    pub fn blocks(&self) -> HeapWalk {
        HeapWalk { next: self.first }
    }

    ////////////////////////////////////////////////////////////
    // Heap extension

    /// Grow the heap by `size` bytes (rounded up to the alignment) and fold the
    /// new space into the free lists, merging with a trailing free block.
    unsafe fn try_extend_heap(&mut self, size: usize) -> Result<FreeBlock, G::Err> {
        let size = align_up(size).unwrap_or(usize::MAX & !(ALIGNMENT - 1));
        let base = self.grower.grow_heap(size)?;

        // The old epilogue's header becomes the new block's header, and it
        // already knows whether the block before it is allocated.
        let block = Block::from_payload(base);
        let prev_alloc = block.header().is_prev_alloc();
        let free = FreeBlock::format(block, size, prev_alloc);
        free.block().next().format_epilogue(false);
        log::debug!(
            "Extended heap by {} bytes at {:#x}; heap size now {}",
            size,
            free.addr(),
            self.grower.heap_size()
        );

        self.buckets.insert(free);
        Ok(self.coalesce(free))
    }

    unsafe fn extend_heap(&mut self, size: usize) -> Option<FreeBlock> {
        match self.try_extend_heap(size) {
            Ok(block) => Some(block),
            Err(err) => {
                log::debug!("Could not extend heap by {} bytes: {:?}", size, err);
                None
            }
        }
    }

    ////////////////////////////////////////////////////////////
    // Coalescing

    /// Merge a free block, already in the free lists, with its free neighbors.
    ///
    /// Returns the merged block, which starts at the previous block if that one
    /// was free.
    unsafe fn coalesce(&mut self, block: FreeBlock) -> FreeBlock {
        let this = block.block();
        let prev = if this.header().is_prev_alloc() {
            None
        } else {
            this.prev().as_free()
        };
        let next = this.next().as_free();

        let (start, size) = match (prev, next) {
            (None, None) => return block,
            (None, Some(next)) => {
                self.buckets.remove(block);
                self.buckets.remove(next);
                (this, block.size() + next.size())
            }
            (Some(prev), None) => {
                self.buckets.remove(block);
                self.buckets.remove(prev);
                (prev.block(), prev.size() + block.size())
            }
            (Some(prev), Some(next)) => {
                self.buckets.remove(block);
                self.buckets.remove(prev);
                self.buckets.remove(next);
                (prev.block(), prev.size() + block.size() + next.size())
            }
        };

        log::trace!(
            "Coalescing {:#x}:{} into {:#x}:{}",
            block.addr(),
            block.size(),
            start.addr(),
            size
        );
        let merged = FreeBlock::format(start, size, start.header().is_prev_alloc());
        self.buckets.insert(merged);
        merged
    }

    ////////////////////////////////////////////////////////////
    // Placement

    /// Find a free block of at least `size` bytes: the best fit within the
    /// first size class, starting at `size`'s own, that has any fit at all.
    pub fn find_fit(&self, size: usize) -> Option<FreeBlock> {
        (class_of(size)..CLASSES).find_map(|class| self.buckets.search_best_fit(class, size))
    }

    /// Allocate `size` bytes out of a free block, splitting off the remainder
    /// if it is large enough to be a block of its own.
    unsafe fn place(&mut self, block: FreeBlock, size: usize) -> Block {
        let total = block.size();
        self.buckets.remove(block);
        self.trim(block.block(), total, size)
    }

    /// Mark the `total` bytes at `block` allocated, keeping only `size` of them
    /// if the rest can stand as a free block. `block` must not be in the free
    /// lists, and any free remainder is coalesced with what follows.
    unsafe fn trim(&mut self, block: Block, total: usize, size: usize) -> Block {
        let prev_alloc = block.header().is_prev_alloc();

        if total - size >= MIN_BLOCK_SIZE {
            let placed = block.format_allocated(size, prev_alloc);
            let rest = FreeBlock::format(placed.next(), total - size, true);
            rest.block().next().set_prev_alloc(false);
            log::trace!(
                "Split {:#x}:{} into {} allocated and {} free at {:#x}",
                block.addr(),
                total,
                size,
                total - size,
                rest.addr()
            );
            self.buckets.insert(rest);
            self.coalesce(rest);
            placed
        } else {
            let placed = block.format_allocated(total, prev_alloc);
            placed.next().set_prev_alloc(true);
            placed
        }
    }

    ////////////////////////////////////////////////////////////
    // Public interface

    /// Allocate at least `size` bytes, aligned to 16.
    ///
    /// Returns `None` if `size` is 0, or if the heap cannot grow enough.
    ///
    /// # Safety
    ///
    /// The heap must not have been corrupted by writes outside of previously
    /// returned allocations.
    pub unsafe fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = block_size(size)?;

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend_heap(cmp::max(asize, self.chunk_size))?,
        };
        let placed = self.place(block, asize);
        log::trace!("malloc({}) -> {:?}", size, placed);

        self.debug_check(line!());
        Some(placed.payload())
    }

    /// Release an allocation. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not released since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let ptr = match ptr {
            None => return,
            Some(ptr) => ptr,
        };

        let block = Block::from_payload(ptr);
        debug_assert!(block.is_alloc(), "releasing unallocated block {:?}", block);
        log::trace!("free({:?})", block);

        let free = FreeBlock::format(block, block.size(), block.header().is_prev_alloc());
        free.block().next().set_prev_alloc(false);
        self.buckets.insert(free);
        self.coalesce(free);

        self.debug_check(line!());
    }

    /// Resize an allocation, preserving the first `min(old, size)` bytes.
    ///
    /// `realloc(None, size)` is `malloc(size)`; `realloc(ptr, 0)` frees `ptr`
    /// and returns `None`. If a new block cannot be found, `None` is returned
    /// and the old allocation is left untouched.
    ///
    /// # Safety
    ///
    /// As for [`RawAlloc::free`].
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let old = match ptr {
            None => return self.malloc(size),
            Some(old) => old,
        };
        if size == 0 {
            self.free(Some(old));
            return None;
        }
        let asize = block_size(size)?;

        let block = Block::from_payload(old);
        if self.resize_in_place(block, asize) {
            log::trace!("realloc({:p}, {}) in place", old, size);
            self.debug_check(line!());
            return Some(old);
        }

        let new = self.malloc(size)?;
        let preserved = cmp::min(size, block.payload_size());
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), preserved);
        self.free(Some(old));
        log::trace!("realloc({:p}, {}) moved to {:p}", old, size, new);
        Some(new)
    }

    /// Shrink `block` to `size`, or grow it into a free successor.
    unsafe fn resize_in_place(&mut self, block: Block, size: usize) -> bool {
        let current = block.size();
        if size <= current {
            self.trim(block, current, size);
            return true;
        }

        let next = match block.next().as_free() {
            Some(next) if current + next.size() >= size => next,
            _ => return false,
        };
        let total = current + next.size();
        self.buckets.remove(next);
        self.trim(block, total, size);
        true
    }

    /// Allocate zeroed space for `count` items of `size` bytes each.
    ///
    /// Returns `None` if `count * size` overflows, or is 0.
    ///
    /// # Safety
    ///
    /// As for [`RawAlloc::malloc`].
    pub unsafe fn calloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.malloc(bytes)?;
        ptr.as_ptr().write_bytes(0, bytes);
        Some(ptr)
    }

    /// Number of bytes the caller may use at `ptr`; at least what was asked
    /// for.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Block::from_payload(ptr).payload_size()
    }

    fn debug_check(&self, lineno: u32) {
        if cfg!(feature = "checks") {
            assert!(
                self.check_heap(lineno),
                "heap consistency check failed at line {}",
                lineno
            );
        }
    }
}
