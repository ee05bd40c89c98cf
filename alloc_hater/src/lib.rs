//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s. Every block handed out is painted with the ID of the
//! operation that produced it; the paint is checked whenever the block is
//! resized or freed, which catches overlapping blocks and lost contents.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{alloc::Layout, cmp, mem::MaybeUninit, ptr::NonNull, slice};

/// Upper bound on generated allocation sizes.
pub const MAX_SIZE: usize = 1 << 20;

/// Upper bound on generated alignments, expressed as a shift.
pub const MAX_ALIGN_SHIFT: u8 = 16;

/// A wrapper around `Layout` which implements `Arbitrary`.
#[derive(Clone, Debug)]
pub struct ArbLayout(pub Layout);

impl arbitrary::Arbitrary<'_> for ArbLayout {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % (MAX_ALIGN_SHIFT + 1);
        let align: usize = 1 << align_shift;

        let size = usize::arbitrary(u)? % MAX_SIZE;

        let layout = match Layout::from_size_align(size, align) {
            Ok(l) => l,
            Err(_) => {
                panic!("invalid layout params: size=0x{size:X} align=0x{align:X}");
            }
        };

        Ok(ArbLayout(layout))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Realloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block with the given layout.
    Alloc(Layout),
    /// Free the outstanding block at index `idx % n`.
    Dealloc(usize),
    /// Resize the outstanding block at index `idx % n` to `new_size` bytes.
    Realloc(usize, usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbLayout::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Realloc => {
                AllocatorOp::Realloc(usize::arbitrary(u)?, usize::arbitrary(u)? % MAX_SIZE)
            }
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of memory according to `layout`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::AllocError>;

    /// Deallocates the block of memory with layout `layout` pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    /// Resizes the block with layout `layout` pointed to by `ptr` to
    /// `new_size` bytes, preserving its contents up to the smaller size.
    ///
    /// On failure the original block must remain allocated and unmodified.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError>;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<u8>,
    // The layout the block currently has.
    layout: Layout,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

fn id_bytes(id: u64) -> impl Iterator<Item = u8> {
    id.to_le_bytes().into_iter().cycle()
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `layout.size()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<u8>, layout: Layout, id: u64) -> Block {
        let mut b = Block { ptr, layout, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice::from_raw_parts_mut(self.ptr.cast().as_ptr(), self.layout.size()) }
    }

    pub fn into_raw_parts(self) -> (NonNull<u8>, Layout) {
        (self.ptr, self.layout)
    }

    /// Returns `true` if the block honors its layout's alignment.
    pub fn is_aligned(&self) -> bool {
        self.ptr.as_ptr() as usize % self.layout.align() == 0
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;

        for (byte, value) in self.as_uninit_slice_mut().iter_mut().zip(id_bytes(id)) {
            byte.write(value);
        }
    }

    /// Verifies that the first `len` bytes of `self` have not been
    /// overwritten.
    pub fn verify_prefix(&self, len: usize) -> bool {
        let len = cmp::min(len, self.layout.size());

        // SAFETY: the block was painted on creation, so it is initialized.
        let slice: &[u8] = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) };

        slice.iter().zip(id_bytes(self.id)).all(|(b, v)| *b == v)
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        self.verify_prefix(self.layout.size())
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    /// The operation that exposed the failure, or `None` if an outstanding
    /// block was found corrupted after the last operation.
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;

            let ok = match op {
                AllocatorOp::Alloc(layout) => match self.subject.allocate(layout) {
                    Ok(ptr) => {
                        let block = unsafe { Block::init(ptr, layout, op_id) };
                        let aligned = block.is_aligned();
                        blocks.push(block);
                        aligned
                    }
                    Err(_) => true,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) => {
                        let intact = block.verify();

                        block.paint(op_id);
                        let (ptr, layout) = block.into_raw_parts();
                        unsafe { self.subject.deallocate(ptr, layout) };

                        intact
                    }
                    None => true,
                },

                AllocatorOp::Realloc(raw_idx, new_size) => match blocks.remove_modulo(raw_idx) {
                    Some(block) => self.realloc(&mut blocks, block, new_size, op_id),
                    None => true,
                },
            };

            if !ok {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        let mut intact = true;
        for block in blocks {
            intact &= block.verify();

            let (ptr, layout) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr, layout) };
        }

        match intact {
            true => Ok(()),
            false => Err(Failed {
                completed,
                failed_op: None,
            }),
        }
    }

    /// Resizes `block`, returning it to `blocks` in either case.
    fn realloc(&mut self, blocks: &mut Blocks, block: Block, new_size: usize, op_id: u64) -> bool {
        if !block.verify() {
            blocks.push(block);
            return false;
        }

        let old_size = block.layout.size();
        let new_layout = match Layout::from_size_align(new_size, block.layout.align()) {
            Ok(l) => l,
            Err(_) => {
                blocks.push(block);
                return true;
            }
        };

        match unsafe { self.subject.reallocate(block.ptr, block.layout, new_size) } {
            Ok(ptr) => {
                let mut moved = Block {
                    ptr,
                    layout: new_layout,
                    id: block.id,
                };

                let ok = moved.is_aligned() && moved.verify_prefix(cmp::min(old_size, new_size));

                moved.paint(op_id);
                blocks.push(moved);
                ok
            }

            Err(_) => {
                let ok = block.verify();
                blocks.push(block);
                ok
            }
        }
    }
}
