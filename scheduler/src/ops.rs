//! Op taxonomy and the lowered AST.
//!
//! The tag sets are closed: these are the low-level ops an accelerator
//! backend must implement. [`LazyOp`] is the immutable tree handed to code
//! generation; leaves are buffer LOAD/CONST, roots are STORE. Trees are
//! ref-counted so fused kernels can share subtrees, with memoized hashing and
//! a content digest for cross-AST caching.

use crate::buffer::Buffer;
use crate::dtype::{as_const, ConstValue, DType};
use fxhash::{FxHashMap, FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use shape::{ShapeTracker, Variable};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use std::cell::OnceCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

// === Op tag sets ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Exp2,
    Log2,
    Cast,
    Sin,
    Sqrt,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Mod,
    CmpLt,
    CmpEq,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TernaryOp {
    Where,
    MulAcc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferOp {
    Load,
    Const,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadOp {
    Empty,
    Const,
    Copy,
    Contiguous,
    Custom,
    Assign,
}

/// The union tag carried by graph nodes and AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Reduce(ReduceOp),
    Buffer(BufferOp),
    Load(LoadOp),
}

impl Op {
    pub fn is_load(&self) -> bool {
        matches!(self, Op::Load(_))
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, Op::Reduce(_))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Op::Buffer(_))
    }
}

impl From<UnaryOp> for Op {
    fn from(op: UnaryOp) -> Op {
        Op::Unary(op)
    }
}
impl From<BinaryOp> for Op {
    fn from(op: BinaryOp) -> Op {
        Op::Binary(op)
    }
}
impl From<TernaryOp> for Op {
    fn from(op: TernaryOp) -> Op {
        Op::Ternary(op)
    }
}
impl From<ReduceOp> for Op {
    fn from(op: ReduceOp) -> Op {
        Op::Reduce(op)
    }
}
impl From<BufferOp> for Op {
    fn from(op: BufferOp) -> Op {
        Op::Buffer(op)
    }
}
impl From<LoadOp> for Op {
    fn from(op: LoadOp) -> Op {
        Op::Load(op)
    }
}

/// Ops whose result changes when their input is zero-padded; padding must not
/// silently flow through them.
pub fn is_unsafe_pad_op(op: Op) -> bool {
    matches!(
        op,
        Op::Binary(BinaryOp::Div)
            | Op::Binary(BinaryOp::CmpLt)
            | Op::Binary(BinaryOp::CmpEq)
            | Op::Unary(UnaryOp::Log2)
            | Op::Unary(UnaryOp::Exp2)
    )
}

// === AST leaf payloads ===

/// A memory operand: buffer index, dtype and the view it is accessed through.
/// Index 0 is the kernel's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemBuffer {
    pub idx: usize,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// An inline constant operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstBuffer {
    pub val: ConstValue,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// Op-specific payload of a graph node or AST node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpArg {
    /// Reduce axes.
    Axes(Vec<usize>),
    /// Cast target and bitcast flag.
    Cast { dtype: DType, bitcast: bool },
    /// Scalar literal of a const loadop.
    Const(ConstValue),
    /// Stored output view of a non-contiguous assign.
    AssignView(ShapeTracker),
    /// Memory operand of a buffer LOAD/STORE.
    Mem(MemBuffer),
    /// Inline constant of a buffer CONST.
    ConstBuf(ConstBuffer),
    /// Opaque tag of a custom kernel.
    Custom(String),
}

// === LazyOp ===

#[derive(Serialize, Deserialize)]
struct LazyOpNode {
    op: Op,
    src: SmallVec<[LazyOp; 2]>,
    arg: Option<OpArg>,
    #[serde(skip)]
    hash: OnceCell<u64>,
    #[serde(skip)]
    key: OnceCell<[u8; 32]>,
}

/// An immutable node of the lowered AST.
///
/// Equality is structural with an identity fast path; a memo over node-pair
/// identities keeps comparison linear on DAGs with shared subtrees.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LazyOp(Rc<LazyOpNode>);

impl LazyOp {
    pub fn new(op: Op, src: &[LazyOp], arg: Option<OpArg>) -> LazyOp {
        LazyOp(Rc::new(LazyOpNode {
            op,
            src: src.iter().cloned().collect(),
            arg,
            hash: OnceCell::new(),
            key: OnceCell::new(),
        }))
    }

    pub fn op(&self) -> Op {
        self.0.op
    }

    pub fn src(&self) -> &[LazyOp] {
        &self.0.src
    }

    pub fn arg(&self) -> Option<&OpArg> {
        self.0.arg.as_ref()
    }

    /// Stable identity of the shared node, for identity-keyed memo maps.
    pub(crate) fn node_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Memoized structural hash.
    pub fn hash64(&self) -> u64 {
        *self.0.hash.get_or_init(|| {
            let mut h = FxHasher::default();
            self.0.op.hash(&mut h);
            self.0.arg.hash(&mut h);
            for s in &self.0.src {
                h.write_u64(s.hash64());
            }
            h.finish()
        })
    }

    /// Memoized SHA-256 content digest over the structural payload, child
    /// digests appended in order. Stable across processes, so safe to key
    /// cross-AST caches on.
    pub fn key(&self) -> [u8; 32] {
        *self.0.key.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(format!("{:?}", (&self.0.op, &self.0.arg)).as_bytes());
            for s in &self.0.src {
                hasher.update(s.key());
            }
            hasher.finalize().into()
        })
    }

    /// The dtype this node evaluates to, where derivable.
    pub fn dtype(&self) -> Option<DType> {
        match (&self.0.op, &self.0.arg) {
            (Op::Buffer(_), Some(OpArg::Mem(m))) => Some(m.dtype.clone()),
            (Op::Buffer(_), Some(OpArg::ConstBuf(c))) => Some(c.dtype.clone()),
            (Op::Unary(UnaryOp::Cast), Some(OpArg::Cast { dtype, .. })) => Some(dtype.clone()),
            (Op::Binary(BinaryOp::CmpLt | BinaryOp::CmpEq), _) => Some(DType::Bool),
            _ => self.0.src.last().and_then(LazyOp::dtype),
        }
    }

    /// Flattened, identity-deduplicated preorder of the tree.
    pub fn lazyops(&self) -> Vec<LazyOp> {
        fn walk(op: &LazyOp, seen: &mut FxHashSet<usize>, out: &mut Vec<LazyOp>) {
            if !seen.insert(op.node_id()) {
                return;
            }
            out.push(op.clone());
            for s in op.src() {
                walk(s, seen, out);
            }
        }
        let mut out = Vec::new();
        walk(self, &mut FxHashSet::default(), &mut out);
        out
    }

    /// Variables referenced by any buffer operand, sorted and deduplicated.
    pub fn vars(&self) -> Vec<Variable> {
        let mut vars: Vec<Variable> = self
            .lazyops()
            .iter()
            .filter_map(|x| match x.arg() {
                Some(OpArg::Mem(m)) => Some(m.st.vars()),
                Some(OpArg::ConstBuf(c)) => Some(c.st.vars()),
                _ => None,
            })
            .flatten()
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }

    fn cached_compare(&self, other: &LazyOp, ctx: &mut FxHashMap<(usize, usize), bool>) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.0.op != other.0.op || self.0.arg != other.0.arg || self.0.src.len() != other.0.src.len() {
            return false;
        }
        let key = (self.node_id(), other.node_id());
        if let Some(&hit) = ctx.get(&key) {
            return hit;
        }
        let ret = self
            .0
            .src
            .iter()
            .zip(&other.0.src)
            .all(|(a, b)| a.cached_compare(b, ctx));
        ctx.insert(key, ret);
        ret
    }
}

impl PartialEq for LazyOp {
    fn eq(&self, other: &Self) -> bool {
        self.cached_compare(other, &mut FxHashMap::default())
    }
}

impl Eq for LazyOp {}

impl Hash for LazyOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash64());
    }
}

// keep the memo cells out of the debug form
impl fmt::Debug for LazyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyOp")
            .field("op", &self.0.op)
            .field("src", &self.0.src)
            .field("arg", &self.0.arg)
            .finish()
    }
}

// === ScheduleItem ===

/// A single kernel ready for code generation.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    pub ast: Vec<LazyOp>,
    pub outputs: Vec<Rc<Buffer>>,
    pub inputs: Vec<Rc<Buffer>>,
}

// === host ALU ===

/// Whether `op` can be evaluated on the host for constant folding.
pub fn has_alu(op: Op) -> bool {
    matches!(
        op,
        Op::Unary(UnaryOp::Exp2 | UnaryOp::Log2 | UnaryOp::Sin | UnaryOp::Sqrt | UnaryOp::Neg)
            | Op::Binary(_)
            | Op::Ternary(TernaryOp::Where)
    )
}

/// Evaluate `op` over host scalars and coerce the result into `dtype`.
pub fn exec_alu(op: Op, dtype: &DType, operands: &[ConstValue]) -> ConstValue {
    let float_path = dtype.is_float() || operands.iter().any(|v| matches!(v, ConstValue::Float(_)));
    let out = match op {
        Op::Unary(UnaryOp::Log2) => {
            let x = operands[0].as_f64();
            ConstValue::Float(if x > 0.0 {
                x.log2()
            } else if x == 0.0 {
                f64::NEG_INFINITY
            } else {
                f64::NAN
            })
        }
        Op::Unary(UnaryOp::Exp2) => ConstValue::Float(operands[0].as_f64().exp2()),
        Op::Unary(UnaryOp::Sqrt) => ConstValue::Float(operands[0].as_f64().sqrt()),
        Op::Unary(UnaryOp::Sin) => ConstValue::Float(operands[0].as_f64().sin()),
        Op::Unary(UnaryOp::Neg) => match operands[0] {
            ConstValue::Bool(b) => ConstValue::Bool(!b),
            ConstValue::Int(i) => ConstValue::Int(i.wrapping_neg()),
            ConstValue::Float(f) => ConstValue::Float(-f),
        },
        Op::Binary(bop) => {
            let (x, y) = (operands[0], operands[1]);
            match bop {
                BinaryOp::CmpLt => return ConstValue::Bool(x.as_f64() < y.as_f64()),
                BinaryOp::CmpEq => return ConstValue::Bool(x.as_f64() == y.as_f64()),
                BinaryOp::Xor => ConstValue::Int(x.as_i64() ^ y.as_i64()),
                BinaryOp::Add if float_path => ConstValue::Float(x.as_f64() + y.as_f64()),
                BinaryOp::Add => ConstValue::Int(x.as_i64().wrapping_add(y.as_i64())),
                BinaryOp::Sub if float_path => ConstValue::Float(x.as_f64() - y.as_f64()),
                BinaryOp::Sub => ConstValue::Int(x.as_i64().wrapping_sub(y.as_i64())),
                BinaryOp::Mul if float_path => ConstValue::Float(x.as_f64() * y.as_f64()),
                BinaryOp::Mul => ConstValue::Int(x.as_i64().wrapping_mul(y.as_i64())),
                BinaryOp::Max if float_path => ConstValue::Float(x.as_f64().max(y.as_f64())),
                BinaryOp::Max => ConstValue::Int(x.as_i64().max(y.as_i64())),
                BinaryOp::Mod => {
                    let (a, b) = (x.as_i64(), y.as_i64());
                    if b == 0 {
                        ConstValue::Int(0)
                    } else {
                        // magnitude modulo, sign follows the dividend
                        let m = a.abs() % b.abs();
                        ConstValue::Int(if a < 0 { -m } else { m })
                    }
                }
                BinaryOp::Div if float_path => {
                    let (a, b) = (x.as_f64(), y.as_f64());
                    ConstValue::Float(if b != 0.0 { a / b } else { a * f64::INFINITY })
                }
                BinaryOp::Div => {
                    let (a, b) = (x.as_i64(), y.as_i64());
                    if b == 0 {
                        ConstValue::Int(0)
                    } else {
                        // truncating division, like a host cast of the float quotient
                        ConstValue::Int((a as f64 / b as f64) as i64)
                    }
                }
            }
        }
        Op::Ternary(TernaryOp::Where) => {
            if operands[0].truthy() {
                operands[1]
            } else {
                operands[2]
            }
        }
        _ => unreachable!("exec_alu on non-ALU op {:?}", op),
    };
    as_const(out, dtype)
}
