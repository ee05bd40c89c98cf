//! Allocator nodes and their chunk registries.

use core::num::NonZeroUsize;

use crate::{
    chunk::{Chunk, ChunkId, ChunkSlot},
    AllocError,
};

/// A handle to a node of an [`AllocTree`].
///
/// Handles are only meaningful for the tree that issued them.
///
/// [`AllocTree`]: crate::AllocTree
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle(u16);

impl NodeHandle {
    #[inline]
    pub(crate) fn new(index: usize) -> NodeHandle {
        NodeHandle(index.try_into().expect("node index overflowed a u16"))
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0.into()
    }
}

/// A snapshot of a node's bookkeeping.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct NodeInfo {
    /// The node's parent, or `None` for the root.
    pub parent: Option<NodeHandle>,
    /// The node's unit size and minimum alignment.
    pub align: usize,
    /// Unallocated bytes across all of the node's chunks.
    pub free_bytes: usize,
    /// The number of chunks the node owns.
    pub chunk_count: usize,
}

/// An entry in the tree's node table.
#[derive(Debug)]
pub enum NodeSlot {
    /// An unused slot, linked into the tree's node free list.
    Free { next: Option<NodeHandle> },
    /// A live node.
    InUse(Node),
}

impl NodeSlot {
    #[inline]
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            NodeSlot::InUse(n) => Some(n),
            NodeSlot::Free { .. } => None,
        }
    }

    #[inline]
    pub fn as_node_mut(&mut self) -> Option<&mut Node> {
        match self {
            NodeSlot::InUse(n) => Some(n),
            NodeSlot::Free { .. } => None,
        }
    }
}

/// An allocation domain owning a list of chunks.
///
/// The chunk table itself lives outside the node; every method that touches
/// chunks takes the node's table as an argument.
#[derive(Debug)]
pub struct Node {
    parent: Option<NodeHandle>,
    align: usize,
    free_bytes: usize,
    chunk_count: usize,
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
    free_head: Option<ChunkId>,
}

impl Node {
    /// Creates a node whose chunk table of `num_chunks` slots is entirely free.
    ///
    /// Every slot of the table must have been reset with [`Node::reset_slot`].
    pub fn new(parent: Option<NodeHandle>, align: usize, num_chunks: usize) -> Node {
        Node {
            parent,
            align,
            free_bytes: 0,
            chunk_count: 0,
            head: None,
            tail: None,
            free_head: (num_chunks > 0).then(|| ChunkId::new(0)),
        }
    }

    /// Returns the free slot value for slot `index` of a freshly reset table.
    #[inline]
    pub fn reset_slot(index: usize, num_chunks: usize) -> ChunkSlot {
        ChunkSlot::Free {
            next: (index + 1 < num_chunks).then(|| ChunkId::new(index + 1)),
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            parent: self.parent,
            align: self.align,
            free_bytes: self.free_bytes,
            chunk_count: self.chunk_count,
        }
    }

    /// Takes a slot from the chunk free list and appends a chunk spanning
    /// `[min, max)` to the in-use list.
    pub fn create_chunk(
        &mut self,
        table: &mut [ChunkSlot],
        min: usize,
        max: usize,
    ) -> Result<ChunkId, AllocError> {
        let id = self.free_head.ok_or(AllocError::TableExhausted)?;

        self.free_head = match table[id.index()] {
            ChunkSlot::Free { next } => next,
            ChunkSlot::InUse(_) => unreachable!("chunk free list links a live chunk"),
        };

        let chunk = Chunk::new(min, max, self.align);
        let size = chunk.size();
        table[id.index()] = ChunkSlot::InUse(chunk);

        match self.tail {
            Some(tail) => chunk_mut(table, tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        self.chunk_count += 1;
        self.free_bytes += size;

        Ok(id)
    }

    /// Scans the in-use list, in creation order, for a chunk that can hold
    /// `size` bytes at `align`.
    pub fn try_allocate(
        &mut self,
        table: &mut [ChunkSlot],
        size: usize,
        align: usize,
    ) -> Option<NonZeroUsize> {
        let mut cursor = self.head;

        while let Some(id) = cursor {
            if let Some(addr) = self.try_allocate_in(table, id, size, align) {
                return Some(addr);
            }

            cursor = chunk_mut(table, id).next;
        }

        None
    }

    /// Attempts to allocate from exactly one chunk.
    pub fn try_allocate_in(
        &mut self,
        table: &mut [ChunkSlot],
        chunk: ChunkId,
        size: usize,
        align: usize,
    ) -> Option<NonZeroUsize> {
        let (addr, consumed) = chunk_mut(table, chunk).try_allocate(size, align)?;
        self.free_bytes -= consumed;

        Some(addr)
    }

    /// Returns the chunk whose range contains `addr`.
    pub fn find_chunk(&self, table: &[ChunkSlot], addr: usize) -> Option<ChunkId> {
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let chunk = chunk_ref(table, id);
            if chunk.contains(addr) {
                return Some(id);
            }

            cursor = chunk.next;
        }

        None
    }

    /// Releases the block of `size` bytes at `addr` in `chunk`.
    pub fn release(&mut self, table: &mut [ChunkSlot], chunk: ChunkId, addr: usize, size: usize) {
        let released = chunk_mut(table, chunk).release(addr, size);
        self.free_bytes += released;
    }
}

/// Returns the live chunk at `id`.
///
/// Panics if the slot is free; in-use list links always name live chunks.
#[inline]
pub fn chunk_ref(table: &[ChunkSlot], id: ChunkId) -> &Chunk {
    table[id.index()]
        .as_chunk()
        .expect("in-use list links a free chunk slot")
}

#[inline]
fn chunk_mut(table: &mut [ChunkSlot], id: ChunkId) -> &mut Chunk {
    table[id.index()]
        .as_chunk_mut()
        .expect("in-use list links a free chunk slot")
}
