//! Heap consistency checking.
//!
//! [`RawAlloc::validate`] walks the heap in address order and every size-class
//! list, and reports the first broken invariant it finds. It never changes
//! anything, and nothing in the allocator depends on its answer; with the
//! `checks` feature enabled it is run after every public call.

use core::fmt;

use crate::allocators::RawAlloc;
use crate::block::{Block, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE};
use crate::grower::HeapGrower;
use crate::seglist::{class_of, CLASSES};

/// A broken heap invariant. Addresses are payload addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A block reachable from a free list is marked allocated.
    AllocatedInFreeList { class: usize, block: usize },
    /// Walking the heap and walking the free lists found different numbers of
    /// free blocks.
    FreeCountMismatch { heap: usize, lists: usize },
    /// A free-list link points outside the heap, or at a block of size 0.
    InvalidFreeLink { class: usize, block: usize },
    /// An allocated block's footer reaches into the next block.
    Overlap { block: usize, next: usize },
    /// A block found while walking the heap lies outside of it.
    OutOfBounds { block: usize },
    /// Two free blocks sit next to each other.
    AdjacentFree { block: usize, next: usize },
    /// A block's footer disagrees with its header.
    TagMismatch { block: usize },
    /// A block's `prev_alloc` bit disagrees with its predecessor.
    PrevAllocMismatch { block: usize },
    /// A block is misaligned, too small, or not a multiple of the alignment.
    BadBlock { block: usize, size: usize },
    /// A free block is filed under the wrong size class.
    WrongClass { class: usize, block: usize, size: usize },
    /// A free-list `prev_free` link does not point back at its predecessor.
    BrokenBackLink { class: usize, block: usize },
    /// The epilogue is not the last word of the heap.
    MisplacedEpilogue { block: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::AllocatedInFreeList { class, block } => write!(
                f,
                "free list {} holds allocated block {:#x}",
                class, block
            ),
            Violation::FreeCountMismatch { heap, lists } => write!(
                f,
                "heap has {} free blocks but the free lists have {}",
                heap, lists
            ),
            Violation::InvalidFreeLink { class, block } => write!(
                f,
                "free list {} has invalid pointer {:#x}",
                class, block
            ),
            Violation::Overlap { block, next } => {
                write!(f, "block {:#x} overlaps the next block {:#x}", block, next)
            }
            Violation::OutOfBounds { block } => {
                write!(f, "heap walk reached {:#x}, outside the heap", block)
            }
            Violation::AdjacentFree { block, next } => write!(
                f,
                "free blocks {:#x} and {:#x} were not coalesced",
                block, next
            ),
            Violation::TagMismatch { block } => {
                write!(f, "block {:#x} has a footer unlike its header", block)
            }
            Violation::PrevAllocMismatch { block } => write!(
                f,
                "block {:#x} disagrees with its predecessor's allocation state",
                block
            ),
            Violation::BadBlock { block, size } => {
                write!(f, "block {:#x} has invalid size {}", block, size)
            }
            Violation::WrongClass { class, block, size } => write!(
                f,
                "block {:#x} of size {} is in free list {}",
                block, size, class
            ),
            Violation::BrokenBackLink { class, block } => write!(
                f,
                "block {:#x} in free list {} does not link back to its predecessor",
                block, class
            ),
            Violation::MisplacedEpilogue { block } => {
                write!(f, "epilogue at {:#x} is not at the top of the heap", block)
            }
        }
    }
}

/// Statistics gathered while validating the heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the grower, including the prologue and epilogue.
    pub heap_size: usize,
    pub allocated_blocks: usize,
    pub allocated_size: usize,
    pub free_blocks: usize,
    pub free_size: usize,
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Check every heap invariant, returning statistics if they all hold.
    pub fn validate(&self) -> Result<Stats, Violation> {
        let mut stats = self.walk_heap()?;
        stats.heap_size = self.grower.heap_size();

        let listed = self.walk_free_lists()?;
        if listed != stats.free_blocks {
            return Err(Violation::FreeCountMismatch {
                heap: stats.free_blocks,
                lists: listed,
            });
        }

        Ok(stats)
    }

    /// Check every heap invariant, logging the first failure along with
    /// `lineno`, the caller's line number.
    pub fn check_heap(&self, lineno: u32) -> bool {
        match self.validate() {
            Ok(_) => true,
            Err(violation) => {
                log::error!(
                    "Heap check failed (line {}): {}; heap is {:p}..={:p}, {} bytes",
                    lineno,
                    violation,
                    self.grower.heap_lo(),
                    self.grower.heap_hi(),
                    self.grower.heap_size()
                );
                false
            }
        }
    }

    /// Whether a whole block, header through the end of its payload, is inside
    /// the heap.
    fn block_in_heap(&self, block: Block, size: usize) -> bool {
        self.grower.contains(block.header_addr(), size)
    }

    fn walk_heap(&self) -> Result<Stats, Violation> {
        let mut stats = Stats::default();
        // The prologue counts as allocated.
        let mut prev_alloc = true;
        let mut prev_free: Option<Block> = None;
        let mut block = self.first_block();

        loop {
            if !self.grower.contains(block.header_addr(), WORD_SIZE) {
                return Err(Violation::OutOfBounds { block: block.addr() });
            }
            let header = block.header();
            let size = header.size();

            if header.is_prev_alloc() != prev_alloc {
                return Err(Violation::PrevAllocMismatch { block: block.addr() });
            }

            if size == 0 {
                // The epilogue
                let top = self.grower.heap_lo() as usize + self.grower.heap_size();
                if !header.is_alloc() || block.header_addr() + WORD_SIZE != top {
                    return Err(Violation::MisplacedEpilogue { block: block.addr() });
                }
                return Ok(stats);
            }

            if block.addr() % ALIGNMENT != 0 || size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
                return Err(Violation::BadBlock {
                    block: block.addr(),
                    size,
                });
            }
            if !self.block_in_heap(block, size) {
                return Err(Violation::OutOfBounds { block: block.addr() });
            }
            if block.footer() != header {
                return Err(Violation::TagMismatch { block: block.addr() });
            }

            let next = block.next();
            if header.is_alloc() {
                if block.footer_addr() + WORD_SIZE > next.header_addr() {
                    return Err(Violation::Overlap {
                        block: block.addr(),
                        next: next.addr(),
                    });
                }
                stats.allocated_blocks += 1;
                stats.allocated_size += size;
                prev_free = None;
            } else {
                if let Some(prev) = prev_free {
                    return Err(Violation::AdjacentFree {
                        block: prev.addr(),
                        next: block.addr(),
                    });
                }
                stats.free_blocks += 1;
                stats.free_size += size;
                prev_free = Some(block);
            }

            prev_alloc = header.is_alloc();
            block = next;
        }
    }

    /// Walk every size class, returning the number of blocks found.
    ///
    /// A cyclic list always comes back to a block whose `prev_free` names
    /// some other block, so the back-link check also ends the walk.
    fn walk_free_lists(&self) -> Result<usize, Violation> {
        let mut count = 0;

        for class in 0..CLASSES {
            let mut expected_prev = None;
            for free in self.buckets.iter(class) {
                let block = free.block();
                if !self.grower.contains(block.header_addr(), WORD_SIZE) {
                    return Err(Violation::InvalidFreeLink {
                        class,
                        block: block.addr(),
                    });
                }
                let size = block.size();
                if size == 0 || !self.block_in_heap(block, size) {
                    return Err(Violation::InvalidFreeLink {
                        class,
                        block: block.addr(),
                    });
                }
                // Both links must fit before either is read.
                if block.addr() % ALIGNMENT != 0 || size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
                    return Err(Violation::BadBlock {
                        block: block.addr(),
                        size,
                    });
                }
                if block.is_alloc() {
                    return Err(Violation::AllocatedInFreeList {
                        class,
                        block: block.addr(),
                    });
                }
                if class_of(size) != class {
                    return Err(Violation::WrongClass {
                        class,
                        block: block.addr(),
                        size,
                    });
                }
                if free.prev_free() != expected_prev {
                    return Err(Violation::BrokenBackLink {
                        class,
                        block: block.addr(),
                    });
                }

                expected_prev = Some(free);
                count += 1;
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::ptr::NonNull;
    use std::vec;

    use test_log::test;

    use crate::block::{FreeBlock, Tag};
    use crate::grower::ToyHeap;

    #[test]
    fn fresh_heap_is_valid() {
        let mut buffer = vec![0u8; 16 * 1024];
        let allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let stats = allocator.validate().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_size, 4096);
        assert_eq!(stats.heap_size, 4096 + 32);
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn detects_allocated_block_in_free_list() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        unsafe {
            let ptr = allocator.malloc(64).unwrap();
            let block = Block::from_payload(ptr);
            // Sneak a still-allocated block into the lists.
            allocator.buckets.insert(FreeBlock::format(block, block.size(), true));
            block.format_allocated(80, true);
        }
        match allocator.validate() {
            Err(Violation::AllocatedInFreeList { class, .. }) => assert_eq!(class, class_of(80)),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!allocator.check_heap(line!()));
    }

    #[test]
    fn detects_unlisted_free_block() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        unsafe {
            let a = allocator.malloc(64).unwrap();
            let _b = allocator.malloc(64).unwrap();
            // Mark free without telling the free lists.
            let block = Block::from_payload(a);
            FreeBlock::format(block, block.size(), true);
            block.next().set_prev_alloc(false);
        }
        assert_eq!(
            allocator.validate(),
            Err(Violation::FreeCountMismatch { heap: 2, lists: 1 })
        );
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        unsafe {
            let a = allocator.malloc(64).unwrap();
            let b = allocator.malloc(64).unwrap();
            let _c = allocator.malloc(64).unwrap();
            allocator.free(Some(a));
            // Free `b` behind the coalescer's back.
            let block = Block::from_payload(b);
            let free = FreeBlock::format(block, block.size(), false);
            block.next().set_prev_alloc(false);
            allocator.buckets.insert(free);
        }
        match allocator.validate() {
            Err(Violation::AdjacentFree { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn detects_footer_and_prev_alloc_damage() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let (a, b) = unsafe { (allocator.malloc(64).unwrap(), allocator.malloc(64).unwrap()) };

        unsafe {
            let block = Block::from_payload(a);
            block.set_footer(Tag::pack(96, true, true));
        }
        assert_eq!(
            allocator.validate(),
            Err(Violation::TagMismatch {
                block: a.as_ptr() as usize
            })
        );

        unsafe {
            let block = Block::from_payload(a);
            block.set_footer(block.header());
            Block::from_payload(b).set_prev_alloc(false);
        }
        assert_eq!(
            allocator.validate(),
            Err(Violation::PrevAllocMismatch {
                block: b.as_ptr() as usize
            })
        );
    }

    #[test]
    fn detects_links_outside_the_heap() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        // A free block in the scratch arena, not in the heap at all.
        let mut arena = crate::block::tests::Arena::new();
        unsafe {
            let outside = FreeBlock::format(arena.block(64), 48, true);
            allocator.buckets.insert(outside);
            assert_eq!(
                allocator.validate(),
                Err(Violation::InvalidFreeLink {
                    class: 1,
                    block: outside.addr()
                })
            );
            allocator.buckets.remove(outside);
        }
        assert!(allocator.validate().is_ok());

        let ptr = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        assert!(!allocator.grower.contains(ptr.as_ptr() as usize, 1));
    }

    #[test]
    fn detects_walk_leaving_the_heap() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        unsafe {
            let ptr = allocator.malloc(64).unwrap();
            // Claim the block runs far past the top of the heap.
            Block::from_payload(ptr).set_header(Tag::pack(1 << 20, true, true));
        }
        match allocator.validate() {
            Err(Violation::OutOfBounds { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn detects_undersized_block() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let ptr = unsafe { allocator.malloc(64).unwrap() };
        unsafe {
            Block::from_payload(ptr).set_header(Tag::pack(16, true, true));
        }
        assert_eq!(
            allocator.validate(),
            Err(Violation::BadBlock {
                block: ptr.as_ptr() as usize,
                size: 16
            })
        );
    }

    #[test]
    fn detects_undersized_block_only_in_free_list() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let fake = unsafe {
            let ptr = allocator.malloc(200).unwrap();
            // A 16-byte "free block" hidden inside a live payload, where the
            // heap walk never looks.
            let inner = Block::from_payload(NonNull::new_unchecked(ptr.as_ptr().add(32)));
            inner.set_header(Tag::pack(16, false, true));
            let fake = inner.as_free().unwrap();
            allocator.buckets.insert(fake);
            fake
        };
        assert_eq!(
            allocator.validate(),
            Err(Violation::BadBlock {
                block: fake.addr(),
                size: 16
            })
        );
    }

    #[test]
    fn detects_block_in_wrong_class() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let b = unsafe {
            let _a = allocator.malloc(64).unwrap();
            let b = allocator.malloc(64).unwrap();
            let _c = allocator.malloc(64).unwrap();
            let d = allocator.malloc(64).unwrap();
            allocator.free(Some(b));

            // Grow `b` over `c` without refiling it: the tags stay consistent,
            // but an 80-byte list now holds a 160-byte block.
            let block = Block::from_payload(b);
            let tag = Tag::pack(160, false, true);
            block.set_header(tag);
            block.set_footer(tag);
            Block::from_payload(d).set_prev_alloc(false);
            b
        };
        assert_eq!(
            allocator.validate(),
            Err(Violation::WrongClass {
                class: class_of(80),
                block: b.as_ptr() as usize,
                size: 160
            })
        );
    }

    #[test]
    fn detects_broken_back_link() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let b = unsafe {
            let _a = allocator.malloc(64).unwrap();
            let b = allocator.malloc(64).unwrap();
            let _c = allocator.malloc(64).unwrap();
            let d = allocator.malloc(64).unwrap();
            let _e = allocator.malloc(64).unwrap();
            allocator.free(Some(b));
            allocator.free(Some(d));

            // The list reads d, b; point b back at itself instead of d.
            let free = Block::from_payload(b).as_free().unwrap();
            assert_eq!(allocator.buckets.head(class_of(80)).map(FreeBlock::addr), Some(d.as_ptr() as usize));
            free.set_prev_free(Some(free));
            b
        };
        assert_eq!(
            allocator.validate(),
            Err(Violation::BrokenBackLink {
                class: class_of(80),
                block: b.as_ptr() as usize
            })
        );
    }

    #[test]
    fn cyclic_list_terminates() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let b = unsafe {
            let _a = allocator.malloc(64).unwrap();
            let b = allocator.malloc(64).unwrap();
            let _c = allocator.malloc(64).unwrap();
            allocator.free(Some(b));

            let free = Block::from_payload(b).as_free().unwrap();
            free.set_next_free(Some(free));
            b
        };
        assert_eq!(
            allocator.validate(),
            Err(Violation::BrokenBackLink {
                class: class_of(80),
                block: b.as_ptr() as usize
            })
        );
    }

    #[test]
    fn detects_misplaced_epilogue() {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
        let top = allocator.grower.heap_lo() as usize + allocator.grower.heap_size();
        // The heap claims 16 more bytes than the epilogue knows about.
        allocator.grower.size += 16;
        assert_eq!(
            allocator.validate(),
            Err(Violation::MisplacedEpilogue { block: top })
        );
    }
}
