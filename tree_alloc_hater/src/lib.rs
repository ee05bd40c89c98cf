#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, ptr::NonNull};

use alloc_hater::Subject;
use tree_alloc::{AllocError, AllocInitError, AllocTree, Global, NodeHandle};

/// An allocator tree whose requests are spread over a fixed set of nodes.
///
/// Allocations cycle through the nodes in creation order, so siblings and
/// ancestors compete for the same region.
pub struct TreeSubject<const NODES: usize, const CHUNKS: usize> {
    tree: AllocTree<Global, NODES, CHUNKS>,
    nodes: Vec<NodeHandle>,
    next: usize,
}

impl<const NODES: usize, const CHUNKS: usize> TreeSubject<NODES, CHUNKS> {
    /// Creates a tree over `root_units` units of `root_align` bytes, with a
    /// chain of child nodes whose alignments are given by `node_aligns`.
    ///
    /// Each entry of `node_aligns` is a `(parent, align)` pair, where
    /// `parent` indexes the nodes created so far (modulo their number, the
    /// root being index 0).
    pub fn new(
        root_units: usize,
        root_align: usize,
        node_aligns: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<Self, AllocInitError> {
        let region_size = root_units
            .checked_mul(root_align)
            .ok_or(AllocInitError::InvalidConfig)?;
        let mut tree = AllocTree::try_new(region_size, root_align)?;
        let mut nodes = vec![tree.root()];

        for (parent, align) in node_aligns {
            let parent = nodes[parent % nodes.len()];

            match tree.create_node(Some(parent), align) {
                Ok(node) => nodes.push(node),
                Err(AllocError::TableExhausted) => break,
                Err(_) => return Err(AllocInitError::InvalidConfig),
            }
        }

        Ok(TreeSubject {
            tree,
            nodes,
            next: 0,
        })
    }

    pub fn tree(&self) -> &AllocTree<Global, NODES, CHUNKS> {
        &self.tree
    }
}

impl<const NODES: usize, const CHUNKS: usize> Subject for TreeSubject<NODES, CHUNKS> {
    type AllocError = AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, Self::AllocError> {
        let node = self.nodes[self.next % self.nodes.len()];
        self.next = self.next.wrapping_add(1);

        self.tree.allocate(node, layout.size(), layout.align())
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.tree.deallocate(ptr, layout.size(), layout.align()) };
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError> {
        unsafe {
            self.tree
                .reallocate(ptr, layout.size(), new_size, layout.align())
        }
    }
}
