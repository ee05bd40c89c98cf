#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use tree_alloc::BITMAP_UNITS;
use tree_alloc_hater::TreeSubject;

const MAX_ROOT_ALIGN_SHIFT: u8 = 12;
const MAX_NODE_ALIGN_SHIFT: u8 = 12;
const MAX_NODES: usize = 8;

#[derive(Clone, Debug)]
struct Args {
    root_units: usize,
    root_align: usize,
    nodes: Vec<(usize, usize)>,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let root_units = 1 + usize::arbitrary(un)? % BITMAP_UNITS;
        let root_align = 1_usize << (u8::arbitrary(un)? % (MAX_ROOT_ALIGN_SHIFT + 1));

        let num_nodes = usize::arbitrary(un)? % MAX_NODES;
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let parent = usize::arbitrary(un)?;
            let align = 1_usize << (u8::arbitrary(un)? % (MAX_NODE_ALIGN_SHIFT + 1));
            nodes.push((parent, align));
        }

        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            root_units,
            root_align,
            nodes,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        root_units,
        root_align,
        nodes,
        ops,
    } = args;

    let tree = match TreeSubject::<16, 64>::new(root_units, root_align, nodes) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(tree);
    eval.evaluate(ops).unwrap();
});
