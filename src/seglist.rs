use core::fmt;

use crate::block::FreeBlock;

/// Number of size classes.
pub const CLASSES: usize = 12;

/// Inclusive upper bound on block size for every class but the last, which
/// takes everything larger.
const CLASS_LIMITS: [usize; CLASSES - 1] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// The size class a block of `size` bytes belongs in.
pub fn class_of(size: usize) -> usize {
    CLASS_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(CLASSES - 1)
}

/// A `SegList` is an array of doubly linked lists of free blocks, one per size
/// class.
///
/// Each block should be considered "owned" by the `SegList` while it is
/// inserted. The links live inside the blocks themselves (see
/// [`FreeBlock`](../block/struct.FreeBlock.html)), so the list itself is just
/// the array of heads.
///
/// It maintains a few internal invariants:
///
/// - Each block is in the list for `class_of(block.size())`, and in no other.
/// - The head of each list has no `prev_free`, the tail has no `next_free`.
/// - For every `a.next_free() == Some(b)`, `b.prev_free() == Some(a)`.
///
/// Order within a list is insertion order (newest first) and carries no
/// meaning beyond tie-breaking in [`SegList::search_best_fit`].
pub struct SegList {
    heads: [Option<FreeBlock>; CLASSES],
}

/// An iterator over one size class, from head to tail.
///
/// Links are followed lazily: a block's `next_free` is only read when the
/// item after it is requested, so a caller can vet each block first.
pub struct ClassIter {
    current: Option<FreeBlock>,
    started: bool,
}

impl Iterator for ClassIter {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        if self.started {
            self.current = self.current?.next_free();
        }
        self.started = true;

        self.current
    }
}

impl Default for SegList {
    fn default() -> Self {
        SegList::new()
    }
}

impl fmt::Display for SegList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegList(")?;
        let mut start = true;
        for class in 0..CLASSES {
            if self.heads[class].is_none() {
                continue;
            }
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}: [", class)?;
            for (i, block) in self.iter(class).enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:#x}:{}", block.addr(), block.size())?;
            }
            write!(f, "]")?;
        }

        write!(f, ")")
    }
}

impl SegList {
    pub const fn new() -> Self {
        SegList {
            heads: [None; CLASSES],
        }
    }

    /// The first block of a class, if any.
    pub fn head(&self, class: usize) -> Option<FreeBlock> {
        self.heads[class]
    }

    pub fn iter(&self, class: usize) -> ClassIter {
        ClassIter {
            current: self.heads[class],
            started: false,
        }
    }

    /// Push a block onto the head of the list for its size class.
    ///
    /// # Safety
    ///
    /// `block` must be a free block, not currently in any list, whose size will
    /// not change until it is removed again.
    pub unsafe fn insert(&mut self, block: FreeBlock) {
        let class = class_of(block.size());
        let old_head = self.heads[class];

        block.set_next_free(old_head);
        block.set_prev_free(None);
        if let Some(old_head) = old_head {
            old_head.set_prev_free(Some(block));
        }
        self.heads[class] = Some(block);
    }

    /// Unlink a block from the list for its size class.
    ///
    /// # Safety
    ///
    /// `block` must currently be in this list, and its size must be the one it
    /// was inserted with.
    pub unsafe fn remove(&mut self, block: FreeBlock) {
        let class = class_of(block.size());

        match (block.prev_free(), block.next_free()) {
            (None, None) => {
                // The only block in its class
                debug_assert_eq!(self.heads[class], Some(block));
                self.heads[class] = None;
            }
            (None, Some(next)) => {
                // The head, with a successor that becomes the new head
                debug_assert_eq!(self.heads[class], Some(block));
                self.heads[class] = Some(next);
                next.set_prev_free(None);
            }
            (Some(prev), None) => {
                // The tail
                prev.set_next_free(None);
            }
            (Some(prev), Some(next)) => {
                // Somewhere in the middle
                prev.set_next_free(Some(next));
                next.set_prev_free(Some(prev));
            }
        }
    }

    /// Best fit within one class: the block of at least `min_size` bytes with
    /// the least slack. An exact fit ends the scan early; among equal slack
    /// the earliest in the list wins.
    pub fn search_best_fit(&self, class: usize, min_size: usize) -> Option<FreeBlock> {
        let mut best: Option<(FreeBlock, usize)> = None;

        for block in self.iter(class) {
            let size = block.size();
            if size < min_size {
                continue;
            }
            let slack = size - min_size;
            if slack == 0 {
                return Some(block);
            }
            match best {
                Some((_, best_slack)) if best_slack <= slack => {}
                _ => best = Some((block, slack)),
            }
        }

        best.map(|(block, _)| block)
    }

    /// Number of blocks across all classes.
    pub fn len(&self) -> usize {
        (0..CLASSES).map(|class| self.iter(class).count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec::Vec;

    use test_log::test;

    use crate::block::tests::Arena;

    #[test]
    fn class_boundaries() {
        assert_eq!(class_of(0), 0);
        assert_eq!(class_of(32), 0);
        assert_eq!(class_of(33), 1);
        assert_eq!(class_of(64), 1);
        assert_eq!(class_of(128), 2);
        assert_eq!(class_of(4096), 7);
        assert_eq!(class_of(4097), 8);
        assert_eq!(class_of(32768), 10);
        assert_eq!(class_of(32769), 11);
        assert_eq!(class_of(usize::MAX & !15), 11);
    }

    fn free_blocks(arena: &mut Arena, sizes: &[usize]) -> Vec<FreeBlock> {
        let mut offset = 16;
        let mut blocks = Vec::new();
        for &size in sizes {
            let block = unsafe { FreeBlock::format(arena.block(offset), size, true) };
            blocks.push(block);
            offset += size;
        }
        blocks
    }

    fn class_contents(list: &SegList, class: usize) -> Vec<FreeBlock> {
        list.iter(class).collect()
    }

    #[test]
    fn insert_pushes_to_head() {
        let mut arena = Arena::new();
        let blocks = free_blocks(&mut arena, &[48, 64, 96, 32]);
        let mut list = SegList::new();
        assert!(list.is_empty());

        unsafe {
            for &block in &blocks {
                list.insert(block);
            }
        }

        assert_eq!(class_contents(&list, 1), [blocks[1], blocks[0]]);
        assert_eq!(class_contents(&list, 2), [blocks[2]]);
        assert_eq!(class_contents(&list, 0), [blocks[3]]);
        assert_eq!(blocks[0].prev_free(), Some(blocks[1]));
        assert_eq!(list.len(), 4);
        log::info!("{}", list);
    }

    #[test]
    fn remove_handles_every_position() {
        let mut arena = Arena::new();
        // Four blocks in class 1, inserted so the list reads 3, 2, 1, 0.
        let blocks = free_blocks(&mut arena, &[48, 48, 64, 64]);
        let mut list = SegList::new();
        unsafe {
            for &block in &blocks {
                list.insert(block);
            }

            // Interior
            list.remove(blocks[1]);
            assert_eq!(class_contents(&list, 1), [blocks[3], blocks[2], blocks[0]]);
            assert_eq!(blocks[0].prev_free(), Some(blocks[2]));

            // Tail
            list.remove(blocks[0]);
            assert_eq!(class_contents(&list, 1), [blocks[3], blocks[2]]);
            assert_eq!(blocks[2].next_free(), None);

            // Head with a successor
            list.remove(blocks[3]);
            assert_eq!(class_contents(&list, 1), [blocks[2]]);
            assert_eq!(blocks[2].prev_free(), None);

            // Sole element
            list.remove(blocks[2]);
        }
        assert!(list.is_empty());
        assert_eq!(list.head(1), None);
    }

    #[test]
    fn best_fit_prefers_least_slack() {
        let mut arena = Arena::new();
        let blocks = free_blocks(&mut arena, &[1024, 304, 272, 512, 288]);
        let mut list = SegList::new();
        unsafe {
            for &block in &blocks {
                list.insert(block);
            }
        }

        // 272, 288, 304 are in class 4 (257..=512) along with 512.
        assert_eq!(list.search_best_fit(4, 260), Some(blocks[2]));
        assert_eq!(list.search_best_fit(4, 280), Some(blocks[4]));
        // Exact
        assert_eq!(list.search_best_fit(4, 512), Some(blocks[3]));
        assert_eq!(list.search_best_fit(4, 513), None);
        assert_eq!(list.search_best_fit(5, 513), Some(blocks[0]));
        assert_eq!(list.search_best_fit(3, 16), None);
    }

    #[test]
    fn best_fit_ties_go_to_the_head() {
        let mut arena = Arena::new();
        let blocks = free_blocks(&mut arena, &[96, 96, 80]);
        let mut list = SegList::new();
        unsafe {
            for &block in &blocks {
                list.insert(block);
            }
        }

        // The list reads 80, 96 (second), 96 (first).
        assert_eq!(list.search_best_fit(2, 90), Some(blocks[1]));
        assert_eq!(list.search_best_fit(2, 80), Some(blocks[2]));
    }
}
