//! The allocator tree.
//!
//! An [`AllocTree`] owns a fixed table of node slots and, for every node, a
//! fixed table of chunk slots. Both tables live in a single metadata region
//! whose layout is given by [`AllocTree::metadata_layout`]; unused slots are
//! threaded into free lists through the tables themselves.

use core::{
    alloc::Layout,
    cmp, fmt,
    num::NonZeroUsize,
    ptr::{self, NonNull},
    slice,
};

use crate::{
    base::BasePtr,
    bitmap::BITMAP_UNITS,
    chunk::{units_for, ChunkId, ChunkSlot},
    node::{chunk_ref, Node, NodeHandle, NodeInfo, NodeSlot},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Address of the fixed metadata table used by [`AllocTree::init`].
pub const MEM_TABLE: usize = 0x0300_0000;
/// Lowest address of the region managed by [`AllocTree::init`].
pub const MEM_MIN: usize = 0x1000_0000;
/// Address one past the end of the region managed by [`AllocTree::init`].
pub const MEM_MAX: usize = 0xC000_0000;

/// Word alignment.
pub const MIN_ALIGN: usize = 1 << 2;
/// Page alignment.
pub const MED_ALIGN: usize = 1 << 12;
/// Alignment of the root node created by [`AllocTree::init`].
pub const ROOT_ALIGN: usize = 1 << 22;

/// Factor by which a node over-allocates when it grows.
pub const GROWTH_FACTOR: usize = 2;

/// Default capacity of the node table.
pub const DEFAULT_NODES: usize = 1024;
/// Default capacity of each node's chunk table.
pub const DEFAULT_CHUNKS: usize = 1024;

const MAX_SLOTS: usize = u16::MAX as usize + 1;

/// Returns the metadata layout and the offset of the chunk tables within it.
fn table_layout<const NODES: usize, const CHUNKS: usize>(
) -> Result<(Layout, usize), AllocInitError> {
    if !(1..=MAX_SLOTS).contains(&NODES) || !(1..=MAX_SLOTS).contains(&CHUNKS) {
        return Err(AllocInitError::InvalidConfig);
    }

    let num_chunks = NODES
        .checked_mul(CHUNKS)
        .ok_or(AllocInitError::InvalidConfig)?;

    let nodes = Layout::array::<NodeSlot>(NODES).map_err(|_| AllocInitError::InvalidConfig)?;
    let chunks =
        Layout::array::<ChunkSlot>(num_chunks).map_err(|_| AllocInitError::InvalidConfig)?;
    let (layout, chunks_offset) = nodes
        .extend(chunks)
        .map_err(|_| AllocInitError::InvalidConfig)?;

    Ok((layout.pad_to_align(), chunks_offset))
}

/// Computes the size of the chunk a node requests from its parent when it
/// grows to fit `size` bytes at `align`.
///
/// The request is rounded up to `align` and multiplied by [`GROWTH_FACTOR`],
/// but never beyond what a chunk with unit `unit` can address.
fn growth_size(size: usize, align: usize, unit: usize) -> Option<usize> {
    let rounded = cmp::max(size, 1).checked_add(align - 1)? & !(align - 1);
    let grown = rounded.checked_mul(GROWTH_FACTOR)?;
    let cap = BITMAP_UNITS.saturating_mul(unit);

    Some(cmp::max(rounded, cmp::min(grown, cap)))
}

/// A hierarchical allocator over a single managed region.
///
/// This takes two const parameters:
/// - `NODES` is the capacity of the node table.
/// - `CHUNKS` is the capacity of each node's chunk table.
///
/// Both must be nonzero and at most `65536`. The metadata they require is
/// reported by [`AllocTree::metadata_layout`].
///
/// The root node is created during construction. Its alignment is the
/// alignment of the managed region, and it owns a single chunk spanning the
/// whole region. Further nodes are created with [`AllocTree::create_node`].
pub struct AllocTree<
    A: BackingAllocator,
    const NODES: usize = DEFAULT_NODES,
    const CHUNKS: usize = DEFAULT_CHUNKS,
> {
    raw: RawTree<NODES, CHUNKS>,
    root: NodeHandle,
    backing_allocator: A,
}

impl AllocTree<Raw> {
    /// Constructs the tree at its fixed location.
    ///
    /// The metadata table is placed at [`MEM_TABLE`] and the root node, with
    /// alignment [`ROOT_ALIGN`], manages `[MEM_MIN, MEM_MAX)`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidLocation`] if the metadata table
    /// would extend into the managed region.
    ///
    /// # Safety
    ///
    /// Both the metadata table and the managed region must be valid for reads
    /// and writes, must not be used by anything else for the lifetime of the
    /// returned tree, and this function must be called at most once.
    pub unsafe fn init() -> Result<AllocTree<Raw>, AllocInitError> {
        let metadata_layout = Self::metadata_layout()?;
        let table_end = MEM_TABLE
            .checked_add(metadata_layout.size())
            .ok_or(AllocInitError::InvalidLocation)?;

        if table_end > MEM_MIN {
            return Err(AllocInitError::InvalidLocation);
        }

        let metadata = NonNull::new(MEM_TABLE as *mut u8).ok_or(AllocInitError::InvalidLocation)?;
        let region = NonNull::new(MEM_MIN as *mut u8).ok_or(AllocInitError::InvalidLocation)?;

        unsafe { Self::new_raw(metadata, region, MEM_MAX - MEM_MIN, ROOT_ALIGN) }
    }
}

impl<const NODES: usize, const CHUNKS: usize> AllocTree<Raw, NODES, CHUNKS> {
    /// Constructs a new `AllocTree` from raw pointers.
    ///
    /// The root node's alignment is `root_align`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `NODES` or `CHUNKS` is out of range, or `region_size` is zero, or
    ///   the root chunk would have more than [`BITMAP_UNITS`] units
    ///   ([`AllocInitError::InvalidConfig`]).
    /// - `metadata` is not aligned to [`Self::metadata_layout()`], `region` is
    ///   not aligned to `root_align`, or the region would extend past the end
    ///   of the address space ([`AllocInitError::InvalidLocation`]).
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `metadata` must be valid for reads and writes for the size of
    ///   [`Self::metadata_layout()`].
    /// - `region` must be valid for reads and writes for `region_size` bytes.
    /// - Neither region may be accessed other than through the returned tree
    ///   for its lifetime.
    ///
    /// [`Self::metadata_layout()`]: AllocTree::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        region_size: usize,
        root_align: usize,
    ) -> Result<AllocTree<Raw, NODES, CHUNKS>, AllocInitError> {
        let raw = unsafe { RawTree::try_new(metadata, region, region_size, root_align)? };
        raw.with_backing_allocator(Raw)
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const NODES: usize, const CHUNKS: usize> AllocTree<Global, NODES, CHUNKS> {
    /// Attempts to construct a new `AllocTree` backed by the global allocator.
    ///
    /// Both the managed region, `region_size` bytes aligned to `root_align`,
    /// and the metadata tables are allocated from the global allocator and
    /// are freed when the tree is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or if sufficient
    /// memory could not be allocated from the global allocator.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        region_size: usize,
        root_align: usize,
    ) -> Result<AllocTree<Global, NODES, CHUNKS>, AllocInitError> {
        let metadata_layout = Self::metadata_layout()?;
        let region_layout = Layout::from_size_align(region_size, root_align)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        if region_layout.size() == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        unsafe {
            // SAFETY: region size is not zero
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            // SAFETY: metadata size is not zero, as NODES is not zero
            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            match RawTree::try_new(metadata, region, region_size, root_align) {
                // Once wrapped, the tree frees both regions on drop.
                Ok(raw) => raw.with_backing_allocator(Global),
                Err(e) => {
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator, const NODES: usize, const CHUNKS: usize> AllocTree<A, NODES, CHUNKS> {
    /// Returns the layout requirements of the metadata tables for a tree of
    /// this type.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `NODES` or `CHUNKS` is
    /// out of range or the tables cannot be represented as a [`Layout`].
    pub fn metadata_layout() -> Result<Layout, AllocInitError> {
        table_layout::<NODES, CHUNKS>().map(|(layout, _)| layout)
    }

    /// Returns the root node.
    #[inline]
    pub fn root(&self) -> NodeHandle {
        self.root
    }

    /// Returns the number of live nodes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.raw.node_count
    }

    /// Returns a snapshot of `node`'s bookkeeping, or `None` if `node` is not
    /// live.
    pub fn node_info(&self, node: NodeHandle) -> Option<NodeInfo> {
        self.raw.node(node).ok().map(Node::info)
    }

    /// Returns the number of ancestors of `node`, or `None` if `node` is not
    /// live.
    pub fn depth(&self, node: NodeHandle) -> Option<usize> {
        self.raw.node(node).ok()?;
        Some(self.raw.depth_of(node))
    }

    /// Returns `true` if `ptr` lies within the managed region.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.raw.base.addr_of(ptr).is_some()
    }

    /// Creates a new node.
    ///
    /// A node without a parent becomes the root; since the root is created
    /// along with the tree, this fails with
    /// [`AllocError::RootAlreadyExists`] for any `AllocTree` in practice.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidAlignment`] if `align` is not a nonzero power of
    ///   two.
    /// - [`AllocError::UnknownNode`] if `parent` is not live.
    /// - [`AllocError::TableExhausted`] if the node table is full.
    /// - [`AllocError::RootAlreadyExists`] if `parent` is `None`.
    pub fn create_node(
        &mut self,
        parent: Option<NodeHandle>,
        align: usize,
    ) -> Result<NodeHandle, AllocError> {
        self.raw.create_node(parent, align)
    }

    /// Attempts to allocate `size` bytes aligned to `align` from `node`.
    ///
    /// The block is aligned to the larger of `align` and the node's own
    /// alignment. If none of the node's chunks can hold it, the node requests
    /// a new chunk from its parent, recursively up to the root.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidAlignment`] if `align` is not a nonzero power of
    ///   two.
    /// - [`AllocError::UnknownNode`] if `node` is not live.
    /// - [`AllocError::OutOfMemory`] if the root cannot provide the memory.
    /// - [`AllocError::TableExhausted`] if a new chunk was needed but the
    ///   node's chunk table is full.
    /// - [`AllocError::AllocationFailed`] if the request is too large for any
    ///   chunk of this node or its size overflows.
    pub fn allocate(
        &mut self,
        node: NodeHandle,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        log::trace!("allocate: node={node:?} size={size} align={align:#x}");

        let addr = self.raw.allocate(node, size, align)?;

        // The returned block inherits the provenance of the base pointer.
        Ok(self.raw.base.with_addr(addr))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// The block is returned to the deepest node owning a chunk that contains
    /// `ptr`. Pointers outside the managed region, or not owned by any chunk,
    /// are logged and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this tree
    /// with a size of `size` bytes.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        log::trace!("deallocate: ptr={ptr:p} size={size} align={align:#x}");

        let owner = self
            .raw
            .base
            .addr_of(ptr)
            .and_then(|addr| self.raw.owner_of(addr.get()).map(|owner| (addr, owner)));

        match owner {
            Some((addr, (node, chunk))) => self.raw.release_in(node, chunk, addr.get(), size),
            None => log::error!("deallocate: {ptr:p} is not owned by this tree"),
        }
    }

    /// Deallocates the memory referenced by `ptr`, which was allocated from
    /// `node`.
    ///
    /// # Errors
    ///
    /// - [`AllocError::UnknownNode`] if `node` is not live.
    /// - [`AllocError::UnknownAddress`] if no chunk of `node` contains `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via `node`
    /// with a size of `size` bytes.
    pub unsafe fn deallocate_in(
        &mut self,
        node: NodeHandle,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), AllocError> {
        let addr = self.raw.base.addr_of(ptr).ok_or(AllocError::UnknownAddress)?;
        self.raw.release(node, addr.get(), size)
    }

    /// Resizes the block referenced by `ptr` from `old_size` to `new_size`
    /// bytes.
    ///
    /// Shrinking never moves the block: `ptr` is returned and the units past
    /// the new size are released. Growing allocates a new block from the
    /// node that owns `ptr`, copies `old_size` bytes into it and frees the
    /// original.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidAlignment`] if `align` is not a nonzero power of
    ///   two.
    /// - [`AllocError::UnknownAddress`] if no chunk owns `ptr`.
    /// - Any error from [`AllocTree::allocate`]. In that case the original
    ///   block is left allocated and unmodified.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this tree
    /// with a size of `old_size` bytes.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        log::trace!("reallocate: ptr={ptr:p} old_size={old_size} new_size={new_size}");

        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let addr = self.raw.base.addr_of(ptr).ok_or(AllocError::UnknownAddress)?;
        let (node, chunk) = self
            .raw
            .owner_of(addr.get())
            .ok_or(AllocError::UnknownAddress)?;

        if new_size <= old_size {
            self.raw.shrink_in(node, chunk, addr.get(), old_size, new_size);
            return Ok(ptr);
        }

        let new = self.allocate(node, new_size, align)?;

        // SAFETY: the blocks are distinct live allocations, `ptr` is valid for
        // `old_size` bytes and `new` for `new_size > old_size` bytes.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size) };

        self.raw.release_in(node, chunk, addr.get(), old_size);

        Ok(new)
    }

    /// Returns the number of bytes actually reserved when `node` allocates
    /// `size` bytes at `align`.
    ///
    /// This is at least `size`: requests are rounded up to whole units of the
    /// node's alignment.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidAlignment`] if `align` is not a nonzero power of
    ///   two.
    /// - [`AllocError::UnknownNode`] if `node` is not live.
    pub fn usable_size(
        &self,
        node: NodeHandle,
        size: usize,
        align: usize,
    ) -> Result<usize, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let unit = self.raw.node(node)?.align();
        Ok(units_for(size, unit).saturating_mul(unit))
    }

    /// Returns `true` if the unit containing `ptr` is currently allocated
    /// from the node that owns it.
    pub fn is_allocated(&self, ptr: NonNull<u8>) -> bool {
        let Some(addr) = self.raw.base.addr_of(ptr) else {
            return false;
        };

        self.raw
            .owner_of(addr.get())
            .map_or(false, |(node, chunk)| {
                chunk_ref(self.raw.chunk_table(node), chunk).is_occupied(addr.get())
            })
    }
}

impl<A: BackingAllocator, const NODES: usize, const CHUNKS: usize> Drop
    for AllocTree<A, NODES, CHUNKS>
{
    fn drop(&mut self) {
        let RawTree {
            base,
            root_align,
            metadata,
            metadata_layout,
            ..
        } = self.raw;

        // Raw-backed trees may manage regions no `Layout` can describe; their
        // backing allocator ignores deallocation anyway.
        if let Ok(region_layout) = Layout::from_size_align(base.extent(), root_align) {
            unsafe {
                self.backing_allocator.deallocate(base.ptr(), region_layout);
                self.backing_allocator.deallocate(metadata, metadata_layout);
            }
        }
    }
}

impl<A: BackingAllocator, const NODES: usize, const CHUNKS: usize> fmt::Debug
    for AllocTree<A, NODES, CHUNKS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocTree")
            .field("base", &self.raw.base.ptr())
            .field("limit", &self.raw.base.limit())
            .field("NODES", &NODES)
            .field("CHUNKS", &CHUNKS)
            .field("root", &self.root)
            .field("node_count", &self.raw.node_count)
            .finish()
    }
}

// SAFETY: the tree has exclusive access to its metadata and managed region;
// the raw pointers it holds are never shared outside of borrows of the tree.
unsafe impl<A, const NODES: usize, const CHUNKS: usize> Send for AllocTree<A, NODES, CHUNKS> where
    A: BackingAllocator + Send
{
}

/// An `AllocTree` without an associated backing allocator or `Drop` impl.
///
/// All of the tree's bookkeeping lives here; `AllocTree` only adds ownership
/// of the backing memory.
struct RawTree<const NODES: usize, const CHUNKS: usize> {
    base: BasePtr,
    root_align: usize,
    metadata: NonNull<u8>,
    metadata_layout: Layout,
    nodes: NonNull<NodeSlot>,
    chunks: NonNull<ChunkSlot>,
    free_head: Option<NodeHandle>,
    root: Option<NodeHandle>,
    node_count: usize,
}

impl<const NODES: usize, const CHUNKS: usize> RawTree<NODES, CHUNKS> {
    /// Validates the configuration and initializes the node table.
    ///
    /// # Safety
    ///
    /// `metadata` must be valid for reads and writes for the size of the
    /// metadata layout, and `region` for `region_size` bytes.
    unsafe fn try_new(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        region_size: usize,
        root_align: usize,
    ) -> Result<RawTree<NODES, CHUNKS>, AllocInitError> {
        let (metadata_layout, chunks_offset) = table_layout::<NODES, CHUNKS>()?;

        if region_size == 0
            || !root_align.is_power_of_two()
            || region_size / root_align > BITMAP_UNITS
        {
            return Err(AllocInitError::InvalidConfig);
        }

        if metadata.as_ptr().align_offset(metadata_layout.align()) != 0
            || region.as_ptr().align_offset(root_align) != 0
        {
            return Err(AllocInitError::InvalidLocation);
        }

        let base = BasePtr::new(region, region_size).ok_or(AllocInitError::InvalidLocation)?;

        let nodes = metadata.cast::<NodeSlot>();

        // SAFETY: `chunks_offset` lies within the metadata layout, and the
        // result is non-null as it is derived from a non-null pointer.
        let chunks = unsafe {
            NonNull::new_unchecked(metadata.as_ptr().add(chunks_offset)).cast::<ChunkSlot>()
        };

        // Thread every node slot into the free list. Chunk tables are
        // initialized when their node is created.
        for i in 0..NODES {
            let next = (i + 1 < NODES).then(|| NodeHandle::new(i + 1));
            unsafe { nodes.as_ptr().add(i).write(NodeSlot::Free { next }) };
        }

        Ok(RawTree {
            base,
            root_align,
            metadata,
            metadata_layout,
            nodes,
            chunks,
            free_head: Some(NodeHandle::new(0)),
            root: None,
            node_count: 0,
        })
    }

    /// Creates the root node and its chunk, then attaches `backing_allocator`.
    fn with_backing_allocator<A: BackingAllocator>(
        mut self,
        backing_allocator: A,
    ) -> Result<AllocTree<A, NODES, CHUNKS>, AllocInitError> {
        // Neither step can fail on fresh tables with nonzero capacities.
        let root = self
            .create_node(None, self.root_align)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        let (min, max) = (self.base.addr().get(), self.base.limit().get());

        // From here on, a failure drops the tree and frees its memory.
        let mut tree = AllocTree {
            raw: self,
            root,
            backing_allocator,
        };

        tree.raw
            .create_chunk(root, min, max)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(tree)
    }

    #[inline]
    fn nodes(&self) -> &[NodeSlot] {
        // SAFETY: every node slot is initialized in `try_new`.
        unsafe { slice::from_raw_parts(self.nodes.as_ptr(), NODES) }
    }

    #[inline]
    fn nodes_mut(&mut self) -> &mut [NodeSlot] {
        // SAFETY: every node slot is initialized in `try_new`.
        unsafe { slice::from_raw_parts_mut(self.nodes.as_ptr(), NODES) }
    }

    fn node(&self, node: NodeHandle) -> Result<&Node, AllocError> {
        self.nodes()
            .get(node.index())
            .and_then(NodeSlot::as_node)
            .ok_or(AllocError::UnknownNode)
    }

    /// Returns the chunk table of `node`, which must be live.
    fn chunk_table(&self, node: NodeHandle) -> &[ChunkSlot] {
        debug_assert!(self.node(node).is_ok());

        // SAFETY: live nodes have had their chunk tables initialized, and the
        // table lies within the metadata region.
        unsafe { slice::from_raw_parts(self.chunks.as_ptr().add(node.index() * CHUNKS), CHUNKS) }
    }

    /// Returns `node` along with its chunk table.
    fn node_parts_mut(
        &mut self,
        node: NodeHandle,
    ) -> Result<(&mut Node, &mut [ChunkSlot]), AllocError> {
        let index = node.index();
        let n = self
            .nodes_mut()
            .get_mut(index)
            .and_then(NodeSlot::as_node_mut)
            .ok_or(AllocError::UnknownNode)? as *mut Node;

        // SAFETY: the node table and the chunk tables are disjoint parts of
        // the metadata region, and the node is live, so its chunk table has
        // been initialized. Both borrows are tied to `&mut self`.
        unsafe {
            let table = slice::from_raw_parts_mut(self.chunks.as_ptr().add(index * CHUNKS), CHUNKS);
            Ok((&mut *n, table))
        }
    }

    fn depth_of(&self, node: NodeHandle) -> usize {
        let mut depth = 0;
        let mut cursor = self.node(node).ok().and_then(Node::parent);

        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.node(parent).ok().and_then(Node::parent);
        }

        depth
    }

    fn create_node(
        &mut self,
        parent: Option<NodeHandle>,
        align: usize,
    ) -> Result<NodeHandle, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        if let Some(p) = parent {
            self.node(p)?;
        }

        let Some(id) = self.free_head else {
            log::warn!("node table exhausted ({} nodes)", NODES);
            return Err(AllocError::TableExhausted);
        };

        if parent.is_none() && self.root.is_some() {
            return Err(AllocError::RootAlreadyExists);
        }

        let next = match self.nodes()[id.index()] {
            NodeSlot::Free { next } => next,
            NodeSlot::InUse(_) => unreachable!("node free list links a live node"),
        };

        // Rebuild the chunk free list so that every chunk slot is available.
        let table = unsafe { self.chunks.as_ptr().add(id.index() * CHUNKS) };
        for i in 0..CHUNKS {
            // SAFETY: the slot lies within this node's chunk table.
            unsafe { table.add(i).write(Node::reset_slot(i, CHUNKS)) };
        }

        self.nodes_mut()[id.index()] = NodeSlot::InUse(Node::new(parent, align, CHUNKS));
        self.free_head = next;
        if parent.is_none() {
            self.root = Some(id);
        }
        self.node_count += 1;

        log::debug!("created node {id:?}: parent={parent:?} align={align:#x}");

        Ok(id)
    }

    fn create_chunk(
        &mut self,
        node: NodeHandle,
        min: usize,
        max: usize,
    ) -> Result<ChunkId, AllocError> {
        let (n, table) = self.node_parts_mut(node)?;

        match n.create_chunk(table, min, max) {
            Ok(chunk) => {
                log::debug!("node {node:?}: new chunk [{min:#x}, {max:#x})");
                Ok(chunk)
            }
            Err(e) => {
                log::warn!("node {node:?}: chunk table exhausted ({} chunks)", CHUNKS);
                Err(e)
            }
        }
    }

    fn allocate(
        &mut self,
        node: NodeHandle,
        size: usize,
        align: usize,
    ) -> Result<NonZeroUsize, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let (n, table) = self.node_parts_mut(node)?;
        let align = cmp::max(n.align(), align);

        // Free bytes may be fragmented across chunks, so a failed scan still
        // falls through to growth.
        if size <= n.free_bytes() {
            if let Some(addr) = n.try_allocate(table, size, align) {
                return Ok(addr);
            }
        }

        self.grow(node, size, align)
    }

    /// Obtains a new chunk for `node` from its parent and allocates from it.
    ///
    /// The chunk spans the whole block the parent reserved, up to what the
    /// node's bitmap can address.
    ///
    /// `align` must already account for the node's own alignment.
    fn grow(
        &mut self,
        node: NodeHandle,
        size: usize,
        align: usize,
    ) -> Result<NonZeroUsize, AllocError> {
        let n = self.node(node)?;
        let unit = n.align();

        let Some(parent) = n.parent() else {
            log::warn!("root exhausted: size={size} align={align:#x}");
            return Err(AllocError::OutOfMemory);
        };

        if units_for(size, unit) > BITMAP_UNITS {
            return Err(AllocError::AllocationFailed);
        }

        let chunk_size = growth_size(size, align, unit).ok_or(AllocError::AllocationFailed)?;

        // The parent hands out whole units of its own alignment, so the block
        // it reserves may be larger than the request.
        let parent_unit = self.node(parent)?.align();
        let reserved = units_for(chunk_size, parent_unit)
            .checked_mul(parent_unit)
            .ok_or(AllocError::AllocationFailed)?;
        let span = cmp::min(reserved, BITMAP_UNITS.saturating_mul(unit));

        log::debug!("node {node:?}: growing by {span} bytes from {parent:?}");

        let min = self.allocate(parent, chunk_size, align)?;

        let created = min
            .get()
            .checked_add(span)
            .ok_or(AllocError::AllocationFailed)
            .and_then(|max| self.create_chunk(node, min.get(), max));

        let chunk = match created {
            Ok(c) => c,
            // Hand the block back so that the parent is left as it was.
            Err(e) => return self.release(parent, min.get(), reserved).and(Err(e)),
        };

        // Parent units past what the chunk can address go back to the parent.
        let leased = units_for(span, parent_unit) * parent_unit;
        if leased < reserved {
            self.release(parent, min.get() + leased, reserved - leased)?;
        }

        let (n, table) = self.node_parts_mut(node)?;
        n.try_allocate_in(table, chunk, size, align)
            .ok_or(AllocError::AllocationFailed)
    }

    /// Returns the deepest node with a chunk containing `addr`, and the chunk.
    fn owner_of(&self, addr: usize) -> Option<(NodeHandle, ChunkId)> {
        let mut owner: Option<(NodeHandle, ChunkId, usize)> = None;

        for (index, slot) in self.nodes().iter().enumerate() {
            let Some(node) = slot.as_node() else {
                continue;
            };

            let handle = NodeHandle::new(index);
            let Some(chunk) = node.find_chunk(self.chunk_table(handle), addr) else {
                continue;
            };

            let depth = self.depth_of(handle);
            if owner.map_or(true, |(_, _, d)| depth > d) {
                owner = Some((handle, chunk, depth));
            }
        }

        owner.map(|(node, chunk, _)| (node, chunk))
    }

    fn release(&mut self, node: NodeHandle, addr: usize, size: usize) -> Result<(), AllocError> {
        let (n, table) = self.node_parts_mut(node)?;
        let chunk = n
            .find_chunk(table, addr)
            .ok_or(AllocError::UnknownAddress)?;

        n.release(table, chunk, addr, size);
        Ok(())
    }

    /// Releases a block whose owner has already been looked up.
    fn release_in(&mut self, node: NodeHandle, chunk: ChunkId, addr: usize, size: usize) {
        if let Ok((n, table)) = self.node_parts_mut(node) {
            n.release(table, chunk, addr, size);
        }
    }

    /// Releases the units of a block past its first `new_size` bytes.
    fn shrink_in(
        &mut self,
        node: NodeHandle,
        chunk: ChunkId,
        addr: usize,
        old_size: usize,
        new_size: usize,
    ) {
        let Ok(unit) = self.node(node).map(Node::align) else {
            return;
        };

        let kept = units_for(new_size, unit) * unit;
        let held = units_for(old_size, unit) * unit;

        if kept < held {
            self.release_in(node, chunk, addr + kept, held - kept);
        }
    }
}
