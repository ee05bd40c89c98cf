//! A spinlocked tree usable as the global allocator.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

use crate::{
    tree::{DEFAULT_CHUNKS, DEFAULT_NODES},
    AllocError, AllocTree, BackingAllocator, NodeHandle,
};

/// A spin locked allocator tree that can be used as the global allocator.
///
/// Every request is served by a single node chosen at initialization.
///
/// ```no_run
/// use tree_alloc::{AllocTree, Raw, SpinLockedTree};
///
/// #[global_allocator]
/// static ALLOCATOR: SpinLockedTree<Raw> = SpinLockedTree::empty();
///
/// pub fn init_heap() {
///     let mut tree = unsafe { AllocTree::init() }.unwrap();
///     // Small blocks are carved from pages, which are leased from the root.
///     let pages = tree.create_node(Some(tree.root()), 4096).unwrap();
///     let heap = tree.create_node(Some(pages), 16).unwrap();
///     ALLOCATOR.init(tree, heap).unwrap();
/// }
/// ```
#[cfg_attr(docs_rs, doc(cfg(feature = "spin")))]
pub struct SpinLockedTree<
    A: BackingAllocator,
    const NODES: usize = DEFAULT_NODES,
    const CHUNKS: usize = DEFAULT_CHUNKS,
>(spin::Mutex<Option<(AllocTree<A, NODES, CHUNKS>, NodeHandle)>>);

impl<A: BackingAllocator, const NODES: usize, const CHUNKS: usize>
    SpinLockedTree<A, NODES, CHUNKS>
{
    /// Creates an empty locked tree, which will always return null on
    /// allocation requests.
    ///
    /// To initialize it, use the `init` method.
    pub const fn empty() -> Self {
        Self(spin::Mutex::new(None))
    }

    /// Installs `tree`, serving every request from `node`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::UnknownNode`] if `node` is not live in `tree`.
    ///
    /// # Panics
    ///
    /// Panics if a tree was already installed.
    pub fn init(
        &self,
        tree: AllocTree<A, NODES, CHUNKS>,
        node: NodeHandle,
    ) -> Result<(), AllocError> {
        tree.node_info(node).ok_or(AllocError::UnknownNode)?;

        let mut slot = self.0.lock();
        assert!(slot.is_none(), "SpinLockedTree was already initialized");

        log::debug!("installed global tree serving node {node:?}");
        *slot = Some((tree, node));

        Ok(())
    }

    /// Checks if a tree was already installed by calling init.
    pub fn was_initialized(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Runs `f` on the installed tree and its serving node.
    ///
    /// Returns `None` if no tree was installed.
    pub fn with_tree<R>(
        &self,
        f: impl FnOnce(&mut AllocTree<A, NODES, CHUNKS>, NodeHandle) -> R,
    ) -> Option<R> {
        let mut slot = self.0.lock();
        slot.as_mut().map(|(tree, node)| f(tree, *node))
    }
}

impl<A: BackingAllocator, const NODES: usize, const CHUNKS: usize> fmt::Debug
    for SpinLockedTree<A, NODES, CHUNKS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never block while formatting; the lock may be held by the caller.
        match self.0.try_lock() {
            Some(slot) => f
                .debug_struct("SpinLockedTree")
                .field("node", &slot.as_ref().map(|(_, node)| *node))
                .finish(),
            None => f.write_str("SpinLockedTree { <locked> }"),
        }
    }
}

unsafe impl<A, const NODES: usize, const CHUNKS: usize> GlobalAlloc
    for SpinLockedTree<A, NODES, CHUNKS>
where
    A: BackingAllocator + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut slot = self.0.lock();
        let Some((tree, node)) = slot.as_mut() else {
            return ptr::null_mut();
        };

        tree.allocate(*node, layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut slot = self.0.lock();
        let (Some(ptr), Some((tree, _))) = (NonNull::new(ptr), slot.as_mut()) else {
            return;
        };

        unsafe { tree.deallocate(ptr, layout.size(), layout.align()) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };

        let mut slot = self.0.lock();
        let Some((tree, _)) = slot.as_mut() else {
            return ptr::null_mut();
        };

        unsafe { tree.reallocate(ptr, layout.size(), new_size, layout.align()) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
