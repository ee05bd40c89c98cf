//! A freestanding, hierarchical bitmap allocator.
//!
//! `tree_alloc` manages a single fixed address range without any underlying
//! heap. Its bookkeeping lives in statically sized tables supplied alongside
//! the managed region, so the allocator never has to allocate its own
//! metadata.
//!
//! ## Structure
//!
//! An [`AllocTree`] is a tree of allocator nodes. Each node owns a list of
//! *chunks*: contiguous address ranges whose free space is tracked by a
//! fixed-size occupancy bitmap, one bit per *unit* of the node's alignment.
//!
//! ```text
//!   root (align = root_align)
//!   └── chunk [MEM_MIN, MEM_MAX)
//!        ├── node A (align = 16)
//!        │    ├── chunk ─ leased from root
//!        │    └── chunk ─ leased from root
//!        └── node B (align = 4096)
//!             └── chunk ─ leased from root
//! ```
//!
//! A request to a node first scans the node's chunks, lowest address first.
//! If none can hold it, the node asks its parent for a block twice the size
//! of the request, wraps it in a new chunk and allocates from there. The root
//! has no parent; once its single chunk is full, allocation fails with
//! [`AllocError::OutOfMemory`].
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case              |
//! |--------------------------|-----------|-------------------------|
//! | Allocate                 | O(1)      | O(depth × chunks × 1024) |
//! | Deallocate               | O(nodes)  | O(nodes × chunks)       |
//!
//! #### Capacity
//!
//! Node and chunk tables have fixed capacities, set by the const parameters
//! of [`AllocTree`]. Running out of slots is reported as
//! [`AllocError::TableExhausted`]; the tables never grow.
//!
//! ## Features
//!
//! - **`sptr`** (default): strict-provenance polyfills on stable Rust.
//! - **`spin`** (default): [`SpinLockedTree`], a `GlobalAlloc` implementation
//!   guarding a tree with a spinlock.
//! - **`alloc`**: constructors backed by the global allocator.

#![doc(html_root_url = "https://docs.rs/tree_alloc/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that are
// now provided by `core`.
#![allow(unstable_name_collisions)]

#[cfg(not(feature = "sptr"))]
compile_error!("The \"sptr\" crate feature must be enabled.");

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
mod chunk;
mod node;
mod polyfill;
mod tree;

#[cfg(feature = "spin")]
mod locked;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    bitmap::BITMAP_UNITS,
    node::{NodeHandle, NodeInfo},
    tree::{
        AllocTree, DEFAULT_CHUNKS, DEFAULT_NODES, GROWTH_FACTOR, MED_ALIGN, MEM_MAX, MEM_MIN,
        MEM_TABLE, MIN_ALIGN, ROOT_ALIGN,
    },
};

#[cfg(feature = "spin")]
pub use crate::locked::SpinLockedTree;

/// Indicates why an allocator operation failed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The requested alignment was zero or not a power of two.
    InvalidAlignment,
    /// A node or chunk table has no free slots left.
    TableExhausted,
    /// A parentless node was requested, but the tree already has a root.
    RootAlreadyExists,
    /// The root node cannot provide any more address space.
    OutOfMemory,
    /// The request could not be satisfied even though the tree obtained
    /// memory for it.
    ///
    /// This is also returned when sizing a request overflows `usize`, or when
    /// a request needs more units than a single chunk can track.
    AllocationFailed,
    /// The node handle does not refer to a live node of this tree.
    UnknownNode,
    /// No chunk in the tree owns the given address.
    UnknownAddress,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidAlignment => "alignment is not a nonzero power of two",
            AllocError::TableExhausted => "allocator table exhausted",
            AllocError::RootAlreadyExists => "allocator tree already has a root node",
            AllocError::OutOfMemory => "managed region exhausted",
            AllocError::AllocationFailed => "allocation failed after growth",
            AllocError::UnknownNode => "node handle is not live in this tree",
            AllocError::UnknownAddress => "address is not owned by any chunk",
        };

        f.write_str(msg)
    }
}

/// The error type for allocator constructors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig,

    /// The location of the allocator is invalid.
    ///
    /// This variant is returned when the full size of the managed region or
    /// its metadata would not fit at the provided address, or when an address
    /// is misaligned.
    InvalidLocation,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::InvalidLocation => f.write_str("invalid allocator location"),
        }
    }
}

/// Rounds `size` up to a multiple of `align`.
///
/// This is the smallest usable size any allocator honoring `align` can
/// report for `size`. Returns `size` unchanged if `align` is not a power of
/// two or rounding would overflow.
pub fn usable_size(size: usize, align: usize) -> usize {
    if !align.is_power_of_two() {
        return size;
    }

    size.checked_add(align - 1)
        .map(|s| s & !(align - 1))
        .unwrap_or(size)
}

/// Types which provide memory which backs an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
