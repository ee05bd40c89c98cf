use core::{num::NonZeroUsize, ptr::NonNull};

use crate::polyfill::NonNullStrict;

/// A pointer to the base of the region of memory managed by an allocator tree.
///
/// Every pointer handed out by the tree is derived from this one, so it
/// carries the provenance of the whole managed region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` spanning `extent` bytes.
    ///
    /// Returns `None` if the region would extend past the end of the address
    /// space.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        NonNullStrict::addr(ptr).get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        NonNullStrict::addr(self.ptr)
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Safe unchecked add: checked in `BasePtr::new`.
        NonZeroUsize::new(self.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: usize) -> bool {
        self.addr().get() <= addr && addr < self.limit().get()
    }

    /// Returns the address of `ptr` if it lies within the region.
    #[inline]
    pub fn addr_of(self, ptr: NonNull<u8>) -> Option<NonZeroUsize> {
        let addr = NonNullStrict::addr(ptr);
        self.contains_addr(addr.get()).then_some(addr)
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr.get()));

        NonNullStrict::with_addr(self.ptr, addr)
    }
}
