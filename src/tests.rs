#![cfg(test)]
extern crate std;

use core::{cmp, ptr::NonNull, slice};

use crate::{AllocError, AllocInitError, AllocTree, Global, NodeHandle};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

fn arbitrary_align(g: &mut Gen, min_shift: u8, max_shift: u8) -> usize {
    1 << (min_shift + u8::arbitrary(g) % (max_shift - min_shift + 1))
}

#[derive(Clone, Debug)]
struct NodeParams {
    /// Index of the parent among the nodes created so far, modulo their
    /// number. The root is always index 0.
    parent: usize,
    align: usize,
}

#[derive(Clone, Debug)]
struct TreeParams {
    root_align: usize,
    root_units: usize,
    nodes: Vec<NodeParams>,
}

impl Arbitrary for TreeParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let num_nodes = usize::arbitrary(g) % 6;

        TreeParams {
            root_align: arbitrary_align(g, 4, 12),
            root_units: 1 + usize::arbitrary(g) % 1024,
            nodes: (0..num_nodes)
                .map(|_| NodeParams {
                    parent: usize::arbitrary(g),
                    align: arbitrary_align(g, 2, 10),
                })
                .collect(),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut items = Vec::with_capacity(self.nodes.len() + 1);

        for i in 0..self.nodes.len() {
            let mut nodes = self.nodes.clone();
            nodes.remove(i);
            items.push(TreeParams {
                nodes,
                ..self.clone()
            });
        }

        if self.root_units > 1 {
            items.push(TreeParams {
                root_units: self.root_units / 2,
                ..self.clone()
            });
        }

        Box::new(items.into_iter())
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
    Realloc,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate `size` bytes aligned to `align` from node `node % n`.
    Allocate {
        node: usize,
        size: usize,
        align: usize,
    },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Resize an existing allocation to `size` bytes.
    Realloc { index: usize, size: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Realloc,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                node: usize::arbitrary(g),
                size: limited_size(g),
                align: arbitrary_align(g, 0, 8),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Realloc => AllocatorOp::Realloc {
                index: usize::arbitrary(g),
                size: limited_size(g),
            },
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

impl Allocation {
    fn pattern(id: OpId, offset: usize) -> u8 {
        id.to_le_bytes()[offset % 4]
    }

    fn bytes(&self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    fn paint(&self) {
        for (i, b) in self.bytes().iter_mut().enumerate() {
            *b = Self::pattern(self.id, i);
        }
    }

    /// Returns `true` if the first `len` bytes still carry this allocation's
    /// pattern.
    fn is_intact(&self, len: usize) -> bool {
        self.bytes()[..len]
            .iter()
            .enumerate()
            .all(|(i, &b)| b == Self::pattern(self.id, i))
    }
}

/// Drives a tree through a sequence of operations, checking that:
/// - every block honors both the requested and the node's alignment,
/// - live blocks never overlap, as each keeps its painted contents,
/// - reallocation preserves contents,
/// - every block is reported free once everything has been deallocated.
struct TreeChecker<const NODES: usize, const CHUNKS: usize> {
    tree: AllocTree<Global, NODES, CHUNKS>,
    nodes: Vec<NodeHandle>,
    allocations: Vec<Allocation>,
    handed_out: Vec<NonNull<u8>>,
    num_ops: u32,
}

impl<const NODES: usize, const CHUNKS: usize> TreeChecker<NODES, CHUNKS> {
    fn new(params: TreeParams, capacity: usize) -> Result<Self, AllocInitError> {
        let mut tree =
            AllocTree::try_new(params.root_units * params.root_align, params.root_align)?;
        let mut nodes = Vec::from([tree.root()]);

        for node in params.nodes {
            let parent = nodes[node.parent % nodes.len()];

            // Small node tables run out; the remaining nodes are skipped.
            match tree.create_node(Some(parent), node.align) {
                Ok(handle) => nodes.push(handle),
                Err(AllocError::TableExhausted) => break,
                Err(_) => return Err(AllocInitError::InvalidConfig),
            }
        }

        Ok(TreeChecker {
            tree,
            nodes,
            allocations: Vec::with_capacity(capacity),
            handed_out: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    /// Returns `true` if `res` is an acceptable outcome for a valid request.
    fn check_result(
        &self,
        node: NodeHandle,
        align: usize,
        res: &Result<NonNull<u8>, AllocError>,
    ) -> bool {
        match res {
            Ok(ptr) => {
                let addr = ptr.as_ptr() as usize;
                let node_align = self.tree.node_info(node).unwrap().align;

                self.tree.contains(*ptr)
                    && self.tree.is_allocated(*ptr)
                    && addr % cmp::max(align, node_align) == 0
            }

            Err(AllocError::OutOfMemory)
            | Err(AllocError::TableExhausted)
            | Err(AllocError::AllocationFailed) => true,

            Err(_) => false,
        }
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { node, size, align } => {
                let node = self.nodes[node % self.nodes.len()];
                let res = self.tree.allocate(node, size, align);

                if !self.check_result(node, align, &res) {
                    return false;
                }

                if let Ok(ptr) = res {
                    let a = Allocation {
                        id: op_id,
                        ptr,
                        size,
                        align,
                    };
                    a.paint();
                    self.handed_out.push(ptr);
                    self.allocations.push(a);
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.is_intact(a.size) {
                    return false;
                }

                unsafe { self.tree.deallocate(a.ptr, a.size, a.align) };
            }

            AllocatorOp::Realloc { index, size } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = &self.allocations[index];

                if !a.is_intact(a.size) {
                    return false;
                }

                let res = unsafe { self.tree.reallocate(a.ptr, a.size, size, a.align) };

                match res {
                    Ok(ptr) => {
                        if size <= a.size && ptr != a.ptr {
                            return false;
                        }

                        let moved = Allocation {
                            id: a.id,
                            ptr,
                            size,
                            align: a.align,
                        };

                        if !self.tree.is_allocated(ptr)
                            || !moved.is_intact(cmp::min(size, a.size))
                        {
                            return false;
                        }

                        let moved = Allocation { id: op_id, ..moved };
                        moved.paint();
                        self.handed_out.push(ptr);
                        self.allocations[index] = moved;
                    }

                    // The original block must survive a failed resize.
                    Err(AllocError::OutOfMemory)
                    | Err(AllocError::TableExhausted)
                    | Err(AllocError::AllocationFailed) => {
                        if !self.tree.is_allocated(a.ptr) || !a.is_intact(a.size) {
                            return false;
                        }
                    }

                    Err(_) => return false,
                }
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !a.is_intact(a.size) {
                return false;
            }

            unsafe { self.tree.deallocate(a.ptr, a.size, a.align) };
        }

        self.handed_out.iter().all(|&ptr| !self.tree.is_allocated(ptr))
    }
}

fn check<const NODES: usize, const CHUNKS: usize>(
    params: TreeParams,
    ops: Vec<AllocatorOp>,
) -> bool {
    let mut checker: TreeChecker<NODES, CHUNKS> =
        TreeChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn tree_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<8, 32> as fn(_, _) -> bool);
    qc.quickcheck(check::<4, 2> as fn(_, _) -> bool);
    qc.quickcheck(check::<16, 1> as fn(_, _) -> bool);
}

#[test]
fn free_usable_size_rounds_to_alignment() {
    assert_eq!(crate::usable_size(0, 8), 0);
    assert_eq!(crate::usable_size(13, 8), 16);
    assert_eq!(crate::usable_size(16, 16), 16);
    assert_eq!(crate::usable_size(13, 3), 13);
    assert_eq!(crate::usable_size(usize::MAX, 8), usize::MAX);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
