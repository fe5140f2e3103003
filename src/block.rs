//! Boundary-tagged heap blocks.
//!
//! Every block in the heap has the same shape: a one-word header, the payload,
//! and a one-word footer holding a copy of the header. The only block without a
//! footer is the zero-sized epilogue that terminates the heap.
//!
//! ```text
//!           Allocated Block                      Free Block
//!         -------------------               -------------------
//!        | H  size/prev/alloc |             | H  size/prev/alloc |
//!        |--------------------|  <- bp ->   |--------------------|
//!        |                    |             |  next free block   |
//!        |      payload       |             |--------------------|
//!        |                    |             |  prev free block   |
//!        |--------------------|             |--------------------|
//!        |  padding (unused)  |             |                    |
//!        |--------------------|             |--------------------|
//!        | F  size/prev/alloc |             | F  size/prev/alloc |
//!         -------------------               -------------------
//! ```
//!
//! A block is named by its payload address (`bp` above). All address
//! arithmetic over headers and footers lives in this module; the rest of the
//! crate only moves between blocks with [`Block::next`] and [`Block::prev`].

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

/// Size of a header or footer word.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Every payload address and every block size is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// Bytes of bookkeeping in every block: one header and one footer.
pub const OVERHEAD: usize = 2 * WORD_SIZE;

/// The smallest block that can hold a header, a footer, and both free-list
/// links.
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;

// The heap layout assumes a header and a footer together fill exactly one
// alignment unit, which is only true with 8-byte words.
const_assert_eq!(OVERHEAD, ALIGNMENT);
const_assert_eq!(MIN_BLOCK_SIZE, OVERHEAD + 2 * size_of::<usize>());

const ALLOC_BIT: usize = 0b01;
const PREV_ALLOC_BIT: usize = 0b10;
const SIZE_MASK: usize = !(ALIGNMENT - 1);

/// The free-list "no link" sentinel. Never a valid payload address.
const NO_LINK: usize = 0;

/// Round `value` up to the next multiple of [`ALIGNMENT`], or `None` on
/// overflow.
pub fn align_up(value: usize) -> Option<usize> {
    Some(value.checked_add(ALIGNMENT - 1)? & SIZE_MASK)
}

/// A packed header or footer word.
///
/// Bit 0 is the allocated flag, bit 1 records whether the block immediately
/// before this one in address order is allocated, and the remaining bits are
/// the block size.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(usize);

impl Tag {
    /// Pack a size (already a multiple of [`ALIGNMENT`]) with both flags.
    pub const fn pack(size: usize, alloc: bool, prev_alloc: bool) -> Tag {
        let mut word = size & SIZE_MASK;
        if alloc {
            word |= ALLOC_BIT;
        }
        if prev_alloc {
            word |= PREV_ALLOC_BIT;
        }
        Tag(word)
    }

    pub const fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    pub const fn is_alloc(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    pub const fn is_prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    /// The same tag with the predecessor flag replaced.
    pub const fn with_prev_alloc(self, prev_alloc: bool) -> Tag {
        Tag::pack(self.size(), self.is_alloc(), prev_alloc)
    }

    pub const fn bits(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag({}, {}, prev {})",
            self.size(),
            if self.is_alloc() { "alloc" } else { "free" },
            if self.is_prev_alloc() { "alloc" } else { "free" },
        )
    }
}

/// A handle to a block in the heap, identified by its payload address.
///
/// Invariants are established by whoever constructs the handle (see
/// [`Block::from_payload`]); once built, reading a block's tags is safe, and
/// writing them is not.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    payload: NonNull<u8>,
}

impl Block {
    /// Name the block whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be preceded by a header word inside a heap managed by a
    /// [`RawAlloc`](../allocators/struct.RawAlloc.html), and, unless the block
    /// is the epilogue, be followed by `size - WORD_SIZE` bytes of that heap.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        Block { payload }
    }

    /// The payload address, as handed out to callers.
    pub fn payload(self) -> NonNull<u8> {
        self.payload
    }

    /// The payload address as an integer, for bounds checks and logging.
    pub fn addr(self) -> usize {
        self.payload.as_ptr() as usize
    }

    /// Address of the header word.
    pub fn header_addr(self) -> usize {
        self.addr().wrapping_sub(WORD_SIZE)
    }

    /// Address of the footer word, as implied by the header's size.
    pub fn footer_addr(self) -> usize {
        self.addr().wrapping_add(self.size()).wrapping_sub(OVERHEAD)
    }

    fn header_word(self) -> *mut usize {
        self.header_addr() as *mut usize
    }

    fn footer_word(self) -> *mut usize {
        self.footer_addr() as *mut usize
    }

    pub fn header(self) -> Tag {
        unsafe { Tag(self.header_word().read()) }
    }

    pub fn footer(self) -> Tag {
        unsafe { Tag(self.footer_word().read()) }
    }

    pub fn size(self) -> usize {
        self.header().size()
    }

    pub fn is_alloc(self) -> bool {
        self.header().is_alloc()
    }

    /// Bytes usable by the caller.
    pub fn payload_size(self) -> usize {
        self.size().saturating_sub(OVERHEAD)
    }

    /// The block immediately after this one in address order.
    ///
    /// The epilogue has size 0, so its "next" block is itself.
    pub fn next(self) -> Block {
        unsafe {
            Block::from_payload(NonNull::new_unchecked(
                self.payload.as_ptr().add(self.size()),
            ))
        }
    }

    /// The block immediately before this one in address order, found through
    /// that block's footer.
    pub fn prev(self) -> Block {
        unsafe {
            let footer = Tag(self.payload.as_ptr().sub(OVERHEAD).cast::<usize>().read());
            Block::from_payload(NonNull::new_unchecked(
                self.payload.as_ptr().sub(footer.size()),
            ))
        }
    }

    /// Overwrite the header word.
    ///
    /// # Safety
    ///
    /// The caller is responsible for keeping the heap's invariants; a wrong
    /// size here corrupts every traversal that passes this block.
    pub unsafe fn set_header(self, tag: Tag) {
        self.header_word().write(tag.bits())
    }

    /// Overwrite the footer word (located using the current header size).
    ///
    /// # Safety
    ///
    /// See [`Block::set_header`].
    pub unsafe fn set_footer(self, tag: Tag) {
        self.footer_word().write(tag.bits())
    }

    /// Write matching header and footer tags for an allocated block of `size`.
    ///
    /// # Safety
    ///
    /// `size` bytes starting at this block's header must belong to the heap
    /// and not overlap any other live block.
    pub unsafe fn format_allocated(self, size: usize, prev_alloc: bool) -> Block {
        let tag = Tag::pack(size, true, prev_alloc);
        self.set_header(tag);
        self.set_footer(tag);
        self
    }

    /// Write a zero-sized, allocated epilogue header at this block.
    ///
    /// # Safety
    ///
    /// This block's header word must be the last word of the heap.
    pub unsafe fn format_epilogue(self, prev_alloc: bool) -> Block {
        self.set_header(Tag::pack(0, true, prev_alloc));
        self
    }

    /// Update the flag recording whether the preceding block is allocated.
    ///
    /// Rewrites the footer too, except for the footerless epilogue.
    ///
    /// # Safety
    ///
    /// See [`Block::set_header`].
    pub unsafe fn set_prev_alloc(self, prev_alloc: bool) {
        let tag = self.header().with_prev_alloc(prev_alloc);
        self.set_header(tag);
        if tag.size() != 0 {
            self.set_footer(tag);
        }
    }

    /// View this block as a free block, if its header says it is one.
    pub fn as_free(self) -> Option<FreeBlock> {
        if self.is_alloc() {
            None
        } else {
            Some(FreeBlock(self))
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:p}, {:?})", self.payload, self.header())
    }
}

/// A block whose header currently says "free".
///
/// The first two payload words of a free block are its `next_free` and
/// `prev_free` links; a `FreeBlock` is the only way to read or write them, and
/// can only be obtained from [`Block::as_free`] or [`FreeBlock::format`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock(Block);

impl FreeBlock {
    /// Write matching free header and footer tags of `size` at `block`.
    ///
    /// The links are left untouched; inserting the block into a
    /// [`SegList`](../seglist/struct.SegList.html) sets them.
    ///
    /// # Safety
    ///
    /// `size` bytes starting at the block's header must belong to the heap,
    /// must not be in use by any program logic, and `size` must be at least
    /// [`MIN_BLOCK_SIZE`].
    pub unsafe fn format(block: Block, size: usize, prev_alloc: bool) -> FreeBlock {
        debug_assert!(size >= MIN_BLOCK_SIZE, "free block of {} bytes", size);
        let tag = Tag::pack(size, false, prev_alloc);
        block.set_header(tag);
        block.set_footer(tag);
        FreeBlock(block)
    }

    pub fn block(self) -> Block {
        self.0
    }

    pub fn size(self) -> usize {
        self.0.size()
    }

    pub fn addr(self) -> usize {
        self.0.addr()
    }

    fn link_words(self) -> (*mut usize, *mut usize) {
        let next = self.0.payload.as_ptr().cast::<usize>();
        (next, next.wrapping_add(1))
    }

    fn decode(word: usize) -> Option<FreeBlock> {
        if word == NO_LINK {
            return None;
        }
        NonNull::new(word as *mut u8).map(|payload| FreeBlock(Block { payload }))
    }

    fn encode(link: Option<FreeBlock>) -> usize {
        link.map(FreeBlock::addr).unwrap_or(NO_LINK)
    }

    /// The next block in this block's size-class list.
    pub fn next_free(self) -> Option<FreeBlock> {
        unsafe { FreeBlock::decode(self.link_words().0.read()) }
    }

    /// The previous block in this block's size-class list.
    pub fn prev_free(self) -> Option<FreeBlock> {
        unsafe { FreeBlock::decode(self.link_words().1.read()) }
    }

    /// # Safety
    ///
    /// Links must only ever be set by the free list that owns this block.
    pub unsafe fn set_next_free(self, next: Option<FreeBlock>) {
        self.link_words().0.write(FreeBlock::encode(next))
    }

    /// # Safety
    ///
    /// See [`FreeBlock::set_next_free`].
    pub unsafe fn set_prev_free(self, prev: Option<FreeBlock>) {
        self.link_words().1.write(FreeBlock::encode(prev))
    }
}

impl fmt::Debug for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeBlock({:p}, {})", self.0.payload, self.size())
    }
}
