//! Cost interpreter: folds a lowered AST into flop and memory estimates.
//!
//! Shared subtrees are counted once: each node's flops are consumed (read and
//! zeroed) by the first parent that folds them in.

use crate::ops::{BufferOp, LazyOp, Op, OpArg, TernaryOp, UnaryOp};
use fxhash::FxHashMap;
use shape::values_of;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlopCounter {
    pub shape: Vec<usize>,
    pub flops: u64,
    /// Bytes moved per buffer index.
    pub mem: FxHashMap<usize, u64>,
}

impl FlopCounter {
    pub fn mem_estimate(&self) -> u64 {
        self.mem.values().sum()
    }

    /// Hand the accumulated flops to a consumer, zeroing them here so a
    /// shared subtree is only billed once.
    fn consume_flops(&mut self) -> u64 {
        std::mem::take(&mut self.flops)
    }
}

fn prod(shape: &[usize]) -> u64 {
    shape.iter().map(|&s| s as u64).product()
}

type NodeCounter = Rc<RefCell<FlopCounter>>;

// keyed by content digest: structurally equal subtrees share one counter, so
// a subtree duplicated during lowering is still billed once
fn run_ast(ast: &LazyOp, memo: &mut FxHashMap<[u8; 32], NodeCounter>) -> NodeCounter {
    let id = ast.key();
    if let Some(hit) = memo.get(&id) {
        return hit.clone();
    }
    let children: Vec<NodeCounter> = ast.src().iter().map(|s| run_ast(s, memo)).collect();
    let fc = match (ast.op(), ast.arg()) {
        (Op::Buffer(BufferOp::Load), Some(OpArg::Mem(m))) => FlopCounter {
            shape: values_of(m.st.shape()),
            flops: 0,
            mem: std::iter::once((m.idx, (m.dtype.itemsize() * m.st.real_size()) as u64)).collect(),
        },
        (Op::Buffer(BufferOp::Const), Some(OpArg::ConstBuf(c))) => FlopCounter {
            shape: values_of(c.st.shape()),
            flops: 0,
            mem: FxHashMap::default(),
        },
        (Op::Buffer(BufferOp::Store), Some(OpArg::Mem(m))) => {
            let mut child = children[0].borrow_mut();
            let mut mem = child.mem.clone();
            mem.insert(m.idx, (m.dtype.itemsize() * m.st.real_size()) as u64);
            FlopCounter { shape: values_of(m.st.shape()), flops: child.consume_flops(), mem }
        }
        (Op::Unary(UnaryOp::Cast), _) => {
            let mut child = children[0].borrow_mut();
            FlopCounter { shape: child.shape.clone(), flops: child.consume_flops(), mem: child.mem.clone() }
        }
        (Op::Unary(_), _) => {
            let mut child = children[0].borrow_mut();
            let shape = child.shape.clone();
            FlopCounter { flops: child.consume_flops() + prod(&shape), mem: child.mem.clone(), shape }
        }
        (Op::Binary(_), _) => {
            let (a, b) = (&children[0], &children[1]);
            let mut mem = a.borrow().mem.clone();
            mem.extend(b.borrow().mem.clone());
            let shape = a.borrow().shape.clone();
            // consume one at a time: both operands may be the same shared node
            let mut flops = a.borrow_mut().consume_flops();
            flops += b.borrow_mut().consume_flops();
            flops += prod(&shape);
            FlopCounter { shape, flops, mem }
        }
        (Op::Ternary(TernaryOp::Where | TernaryOp::MulAcc), _) => {
            let mut mem = children[0].borrow().mem.clone();
            mem.extend(children[1].borrow().mem.clone());
            mem.extend(children[2].borrow().mem.clone());
            let shape = children[0].borrow().shape.clone();
            let flops = children.iter().map(|c| c.borrow_mut().consume_flops()).sum::<u64>() + prod(&shape);
            FlopCounter { shape, flops, mem }
        }
        (Op::Reduce(_), Some(OpArg::Axes(axes))) => {
            let mut child = children[0].borrow_mut();
            let in_shape = child.shape.clone();
            let shape: Vec<usize> = in_shape
                .iter()
                .enumerate()
                .map(|(i, &s)| if axes.contains(&i) { 1 } else { s })
                .collect();
            FlopCounter { shape, flops: child.consume_flops() + prod(&in_shape), mem: child.mem.clone() }
        }
        (op, arg) => unreachable!("no flop rule for {:?} with arg {:?}", op, arg),
    };
    let rc = Rc::new(RefCell::new(fc));
    memo.insert(id, rc.clone());
    rc
}

thread_local! {
    static INFO_CACHE: RefCell<FxHashMap<[u8; 32], FlopCounter>> = RefCell::new(FxHashMap::default());
}

/// Fold an AST into a [`FlopCounter`]. Memoized by content digest, so the
/// cache is shared across structurally identical ASTs.
pub fn get_lazyop_info(ast: &LazyOp) -> FlopCounter {
    let key = ast.key();
    if let Some(hit) = INFO_CACHE.with(|c| c.borrow().get(&key).cloned()) {
        return hit;
    }
    let mut memo = FxHashMap::default();
    let out = run_ast(ast, &mut memo).borrow().clone();
    INFO_CACHE.with(|c| c.borrow_mut().insert(key, out.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{ConstValue, DType};
    use crate::ops::{BinaryOp, ConstBuffer, MemBuffer, ReduceOp};
    use shape::{dims_of, ShapeTracker};

    fn load(idx: usize, shape: &[usize]) -> LazyOp {
        LazyOp::new(
            Op::Buffer(BufferOp::Load),
            &[],
            Some(OpArg::Mem(MemBuffer {
                idx,
                dtype: DType::Float32,
                st: ShapeTracker::from_shape(dims_of(shape)),
            })),
        )
    }

    fn store(inner: LazyOp, shape: &[usize]) -> LazyOp {
        LazyOp::new(
            Op::Buffer(BufferOp::Store),
            &[inner],
            Some(OpArg::Mem(MemBuffer {
                idx: 0,
                dtype: DType::Float32,
                st: ShapeTracker::from_shape(dims_of(shape)),
            })),
        )
    }

    #[test]
    fn test_elementwise_flops_and_mem() {
        let add = LazyOp::new(Op::Binary(BinaryOp::Add), &[load(1, &[10, 10]), load(2, &[10, 10])], None);
        let info = get_lazyop_info(&store(add, &[10, 10]));
        assert_eq!(info.flops, 100);
        assert_eq!(info.shape, vec![10, 10]);
        // two loads and a store, four bytes an element
        assert_eq!(info.mem_estimate(), 3 * 400);
    }

    #[test]
    fn test_reduce_flops_count_input_shape() {
        let sum = LazyOp::new(
            Op::Reduce(ReduceOp::Sum),
            &[load(1, &[16, 32])],
            Some(OpArg::Axes(vec![1])),
        );
        let info = get_lazyop_info(&store(sum, &[16, 1]));
        assert_eq!(info.flops, 16 * 32);
        assert_eq!(info.shape, vec![16, 1]);
    }

    #[test]
    fn test_shared_subtree_counted_once() {
        let x = LazyOp::new(Op::Binary(BinaryOp::Add), &[load(1, &[8]), load(2, &[8])], None);
        let sq = LazyOp::new(Op::Binary(BinaryOp::Mul), &[x.clone(), x], None);
        let info = get_lazyop_info(&store(sq, &[8]));
        // the add is billed once even though both MUL operands reference it
        assert_eq!(info.flops, 8 + 8);
    }

    #[test]
    fn test_cast_is_free() {
        let c = LazyOp::new(
            Op::Unary(UnaryOp::Cast),
            &[load(1, &[4])],
            Some(OpArg::Cast { dtype: DType::Float64, bitcast: false }),
        );
        let info = get_lazyop_info(&store(c, &[4]));
        assert_eq!(info.flops, 0);
    }

    #[test]
    fn test_const_has_no_mem() {
        let c = LazyOp::new(
            Op::Buffer(BufferOp::Const),
            &[],
            Some(OpArg::ConstBuf(ConstBuffer {
                val: ConstValue::Float(1.0),
                dtype: DType::Float32,
                st: ShapeTracker::from_shape(dims_of(&[4])),
            })),
        );
        let add = LazyOp::new(Op::Binary(BinaryOp::Add), &[load(1, &[4]), c], None);
        let info = get_lazyop_info(&store(add, &[4]));
        assert_eq!(info.mem.len(), 2);
        assert_eq!(info.flops, 4);
    }
}
