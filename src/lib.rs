#![no_std]

//! A segregated-fit memory allocator.
//!
//! The allocator manages one contiguous, growable heap obtained from a
//! [`HeapGrower`](grower/trait.HeapGrower.html). Blocks carry boundary tags at
//! both ends, free blocks are filed in twelve size-class lists, requests are
//! served best-fit within the first class that can serve them, and freed
//! blocks are merged with their free neighbors immediately.
//!
//! ```ignore
//! use seglist_allocator::{RawAlloc, ToyHeap};
//!
//! let mut buffer = vec![0u8; 1 << 20];
//! let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer)).unwrap();
//! unsafe {
//!     let ptr = allocator.malloc(100).unwrap();
//!     allocator.free(Some(ptr));
//! }
//! assert!(allocator.check_heap(line!()));
//! ```
//!
//! Nothing here is thread-safe: a `RawAlloc` is a plain value, and every
//! operation takes `&mut self`.

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod block;
pub mod check;
pub mod grower;
pub mod seglist;

pub use allocators::{RawAlloc, CHUNK_SIZE};
pub use block::{ALIGNMENT, MIN_BLOCK_SIZE};
pub use check::{Stats, Violation};
#[cfg(feature = "use_libc")]
pub use grower::{LibcHeapError, LibcHeapGrower};
pub use grower::{HeapGrower, ToyHeap, ToyHeapOverflowError};
