//! Sources of heap memory.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap. Unlike `mmap`, it behaves like a restricted
//! `sbrk`: the heap is one contiguous region, and each growth extends it by
//! exactly the number of bytes asked for.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a caller-provided buffer that can pretend to be a heap, and
//! implements `HeapGrower` for such a purpose. It is mainly useful for testing.
//!
//! ### `LibcHeapGrower`
//!
//! With the `use_libc` feature, `LibcHeapGrower` reserves one large region of
//! virtual memory with `mmap` and hands it out contiguously.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::block::ALIGNMENT;

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes, returning the address of the
    /// first new byte (the previous top of the heap).
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this crate:
    ///
    /// - Successive successful calls must return adjacent regions, so that
    ///   the heap stays contiguous.
    /// - The first region must start at a 16-byte aligned address.
    /// - The memory returned must be available and untracked by any other
    ///   rust code, including the allocator itself.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Address of the first byte of the heap.
    fn heap_lo(&self) -> *const u8;

    /// Address of the last byte of the heap.
    fn heap_hi(&self) -> *const u8 {
        self.heap_lo()
            .wrapping_add(self.heap_size())
            .wrapping_sub(1)
    }

    /// Number of bytes the heap has grown by so far.
    fn heap_size(&self) -> usize;

    /// Whether `addr..addr + len` lies entirely within the heap.
    fn contains(&self, addr: usize, len: usize) -> bool {
        let lo = self.heap_lo() as usize;
        match addr.checked_add(len) {
            Some(end) => addr >= lo && end <= lo + self.heap_size(),
            None => false,
        }
    }
}

/// A fixed-capacity heap carved out of a borrowed buffer.
///
/// The start of the buffer is skipped up to the first 16-byte boundary.
pub struct ToyHeap<'buf> {
    base: NonNull<u8>,
    pub capacity: usize,
    pub size: usize,
    _buffer: PhantomData<&'buf mut [u8]>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl<'buf> ToyHeap<'buf> {
    pub fn new(buffer: &'buf mut [u8]) -> Self {
        let skip = buffer.as_ptr().align_offset(ALIGNMENT).min(buffer.len());
        let capacity = buffer.len() - skip;
        let base = buffer[skip..].as_mut_ptr();
        ToyHeap {
            // Slices are never null, even when empty.
            base: NonNull::new(base).unwrap_or_else(NonNull::dangling),
            capacity,
            size: 0,
            _buffer: PhantomData,
        }
    }
}

impl<'buf> HeapGrower for ToyHeap<'buf> {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.capacity - self.size;
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let ptr = NonNull::new_unchecked(self.base.as_ptr().add(self.size));
        self.size += size;
        Ok(ptr)
    }

    fn heap_lo(&self) -> *const u8 {
        self.base.as_ptr()
    }

    fn heap_size(&self) -> usize {
        self.size
    }
}

#[cfg(feature = "use_libc")]
pub use self::libc_grower::{LibcHeapError, LibcHeapGrower};

#[cfg(feature = "use_libc")]
mod libc_grower {
    use core::ptr::{null_mut, NonNull};

    use errno::Errno;

    use super::HeapGrower;

    #[derive(Debug)]
    pub enum LibcHeapError {
        /// `mmap` refused to reserve the region.
        Mmap(Errno),
        /// The reservation is used up.
        Exhausted { requested: usize, available: usize },
    }

    /// LibcHeapGrower uses virtual memory to grow the heap upon request.
    ///
    /// The whole capacity is reserved on the first growth and never moves, so
    /// the heap stays contiguous. The reservation is unmapped on drop.
    pub struct LibcHeapGrower {
        base: *mut u8,
        capacity: usize,
        size: usize,
        // Just for tracking, not really needed
        growths: usize,
    }

    impl Default for LibcHeapGrower {
        fn default() -> Self {
            LibcHeapGrower::with_capacity(LibcHeapGrower::DEFAULT_CAPACITY)
        }
    }

    impl LibcHeapGrower {
        pub const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

        /// A grower that will reserve `capacity` bytes (rounded up to whole
        /// pages) on first use.
        pub fn with_capacity(capacity: usize) -> Self {
            LibcHeapGrower {
                base: null_mut(),
                capacity,
                size: 0,
                growths: 0,
            }
        }

        pub fn growths(&self) -> usize {
            self.growths
        }

        unsafe fn reserve(&mut self, requested: usize) -> Result<(), LibcHeapError> {
            let pagesize = sysconf::page::pagesize();
            let capacity = match self.capacity.checked_add(pagesize - 1) {
                Some(padded) => padded / pagesize * pagesize,
                None => {
                    return Err(LibcHeapError::Exhausted {
                        requested,
                        available: 0,
                    })
                }
            };

            #[allow(unused_mut)]
            let mut flags = libc::MAP_ANON | libc::MAP_PRIVATE;
            // Only pages we touch need backing.
            #[cfg(target_os = "linux")]
            {
                flags |= libc::MAP_NORESERVE;
            }

            let ptr = libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                capacity,
                libc::PROT_WRITE | libc::PROT_READ,
                flags,
                // We don't want a memory mapped file.
                -1,
                0,
            );

            if ptr == libc::MAP_FAILED {
                return Err(LibcHeapError::Mmap(errno::errno()));
            }

            log::debug!("Reserved {} bytes of heap at {:p}", capacity, ptr);
            self.base = ptr as *mut u8;
            self.capacity = capacity;
            Ok(())
        }
    }

    impl HeapGrower for LibcHeapGrower {
        type Err = LibcHeapError;

        unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
            if self.base.is_null() {
                self.reserve(size)?;
            }

            let available = self.capacity - self.size;
            if size > available {
                return Err(LibcHeapError::Exhausted {
                    requested: size,
                    available,
                });
            }

            let ptr = NonNull::new_unchecked(self.base.add(self.size));
            self.size += size;
            self.growths += 1;
            Ok(ptr)
        }

        fn heap_lo(&self) -> *const u8 {
            self.base
        }

        fn heap_size(&self) -> usize {
            self.size
        }
    }

    impl Drop for LibcHeapGrower {
        fn drop(&mut self) {
            if self.base.is_null() {
                return;
            }
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.capacity);
            }
        }
    }

}
