//! The lazy tensor graph.
//!
//! A [`LazyBuffer`] is an immutable DAG node: either a *base* that carries an
//! op, sources and an owned backing-buffer slot, or a *view* that applies a
//! shape tracker to a base. Constructors simplify algebraically as they build
//! (constant folding, identity elimination, split-reduce) and deduplicate
//! structurally through a weak-valued cache, so unreachable nodes age out as
//! the front end drops them.

use crate::buffer::Buffer;
use crate::config::Config;
use crate::dtype::{as_const, ConstValue, DType};
use crate::error::LazyError;
use crate::ops::{exec_alu, has_alu, BinaryOp, LoadOp, Op, OpArg, ReduceOp, TernaryOp, UnaryOp};
use fxhash::FxHashMap;
use shape::{all_fixed, prod_dims, values_of, Dim, ShapeTracker};
use smallvec::{smallvec, SmallVec};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

type Srcs = SmallVec<[LazyBuffer; 3]>;

enum Kind {
    Base {
        op: Op,
        arg: Option<OpArg>,
        /// Detached (set to `None`) once the node is scheduled; a base with
        /// detached sources reads as realized.
        srcs: RefCell<Option<Srcs>>,
        buffer: Rc<Buffer>,
        forced_realize: Cell<bool>,
        /// Weak back-reference to a CONTIGUOUS child plus the inverse tracker,
        /// used to re-fuse a forced realize when an elementwise consumer shows
        /// up later.
        contiguous_child: RefCell<Option<(Weak<LazyBufferInner>, ShapeTracker)>>,
    },
    View {
        base: LazyBuffer,
    },
}

pub struct LazyBufferInner {
    device: String,
    st: ShapeTracker,
    /// Mutable only for the image-dtype fallback.
    dtype: RefCell<DType>,
    kind: Kind,
}

/// Handle to a lazy graph node. Equality and hashing are by node identity.
#[derive(Clone)]
pub struct LazyBuffer(Rc<LazyBufferInner>);

impl PartialEq for LazyBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LazyBuffer {}

impl Hash for LazyBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(Rc::as_ptr(&self.0) as usize);
    }
}

impl fmt::Debug for LazyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            Kind::Base { op, .. } => write!(
                f,
                "<LB {} {:?} contig:{} {:?} realized:{}>",
                self.0.device,
                values_of(self.shape()),
                self.0.st.contiguous(),
                op,
                self.realized().is_some()
            ),
            Kind::View { .. } => write!(
                f,
                "<LB {} {:?} contig:{} view of base>",
                self.0.device,
                values_of(self.shape()),
                self.0.st.contiguous()
            ),
        }
    }
}

// === structural cache ===

#[derive(Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Base {
        device: String,
        st: ShapeTracker,
        dtype: DType,
        op: Op,
        arg: Option<OpArg>,
        srcs: Vec<usize>,
    },
    View {
        st: ShapeTracker,
        base: usize,
    },
}

thread_local! {
    static LAZYCACHE: RefCell<FxHashMap<CacheKey, Weak<LazyBufferInner>>> =
        RefCell::new(FxHashMap::default());
}

fn cache_get(key: &CacheKey) -> Option<LazyBuffer> {
    LAZYCACHE.with(|c| {
        let mut c = c.borrow_mut();
        match c.get(key) {
            Some(weak) => match weak.upgrade() {
                Some(rc) => Some(LazyBuffer(rc)),
                None => {
                    c.remove(key);
                    None
                }
            },
            None => None,
        }
    })
}

fn cache_put(key: CacheKey, val: &LazyBuffer) {
    LAZYCACHE.with(|c| c.borrow_mut().insert(key, Rc::downgrade(&val.0)));
}

/// Central node factory: zero-size short-circuit, const coercion, structural
/// cache, and the assign/buffer ownership rules.
pub(crate) fn create_lazybuffer(
    device: &str,
    st: ShapeTracker,
    dtype: DType,
    mut op: Option<Op>,
    mut arg: Option<OpArg>,
    mut srcs: Srcs,
    mut base: Option<LazyBuffer>,
    mut enable_cache: bool,
) -> Result<LazyBuffer, LazyError> {
    if st.size() == 0 {
        op = Some(Op::Load(LoadOp::Const));
        arg = Some(OpArg::Const(ConstValue::Int(0)));
        srcs.clear();
        base = None;
    }
    if op == Some(Op::Load(LoadOp::Const)) {
        let val = match &arg {
            Some(OpArg::Const(c)) => *c,
            _ => ConstValue::Int(0),
        };
        arg = Some(OpArg::Const(as_const(val, &dtype)));
        enable_cache = true;
    }

    let cache_key = match &base {
        None => CacheKey::Base {
            device: device.to_string(),
            st: st.clone(),
            dtype: dtype.clone(),
            op: op.expect("base node requires an op"),
            arg: arg.clone(),
            srcs: srcs.iter().map(LazyBuffer::node_id).collect(),
        },
        Some(b) => CacheKey::View { st: st.clone(), base: b.node_id() },
    };
    if enable_cache {
        if let Some(hit) = cache_get(&cache_key) {
            return Ok(hit);
        }
    }

    let kind = match base {
        None => {
            let op = op.expect("base node requires an op");
            let buffer = if op == Op::Load(LoadOp::Assign) {
                if srcs[1].base().realized().is_none() {
                    return Err(LazyError::UnrealizedAssignTarget);
                }
                srcs[1].base().buffer()
            } else {
                Buffer::new(device, st.size(), dtype.clone())
            };
            Kind::Base {
                op,
                arg,
                srcs: RefCell::new(Some(srcs)),
                buffer,
                forced_realize: Cell::new(false),
                contiguous_child: RefCell::new(None),
            }
        }
        Some(b) => {
            assert!(b.is_base(), "base of a view must be a base itself");
            Kind::View { base: b }
        }
    };
    let ret = LazyBuffer(Rc::new(LazyBufferInner {
        device: device.to_string(),
        st,
        dtype: RefCell::new(dtype),
        kind,
    }));
    if enable_cache {
        cache_put(cache_key, &ret);
    }
    Ok(ret)
}

impl LazyBuffer {
    // === queries ===

    pub fn device(&self) -> &str {
        &self.0.device
    }

    pub fn st(&self) -> &ShapeTracker {
        &self.0.st
    }

    pub fn shape(&self) -> &[Dim] {
        self.0.st.shape()
    }

    pub fn size(&self) -> usize {
        self.0.st.size()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype.borrow().clone()
    }

    pub fn is_base(&self) -> bool {
        matches!(self.0.kind, Kind::Base { .. })
    }

    pub fn base(&self) -> LazyBuffer {
        match &self.0.kind {
            Kind::Base { .. } => self.clone(),
            Kind::View { base } => base.clone(),
        }
    }

    /// The backing buffer once this node can no longer be scheduled. A base
    /// with detached sources is realized; views never are.
    pub fn realized(&self) -> Option<Rc<Buffer>> {
        match &self.0.kind {
            Kind::Base { srcs, buffer, .. } if srcs.borrow().is_none() => Some(buffer.clone()),
            _ => None,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.base().realized().is_some()
    }

    pub fn op(&self) -> Option<Op> {
        match &self.0.kind {
            Kind::Base { op, .. } => Some(*op),
            Kind::View { .. } => None,
        }
    }

    pub fn arg(&self) -> Option<OpArg> {
        match &self.0.kind {
            Kind::Base { arg, .. } => arg.clone(),
            Kind::View { .. } => None,
        }
    }

    pub fn const_arg(&self) -> Option<ConstValue> {
        match self.arg() {
            Some(OpArg::Const(c)) => Some(c),
            _ => None,
        }
    }

    /// Sources of a base node; empty once detached by the scheduler.
    pub fn srcs_vec(&self) -> Srcs {
        match &self.0.kind {
            Kind::Base { srcs, .. } => srcs.borrow().clone().unwrap_or_default(),
            Kind::View { .. } => smallvec![],
        }
    }

    pub fn src(&self, i: usize) -> LazyBuffer {
        self.srcs_vec()[i].clone()
    }

    /// The buffer slot owned by this node's base.
    pub fn buffer(&self) -> Rc<Buffer> {
        match &self.base().0.kind {
            Kind::Base { buffer, .. } => buffer.clone(),
            Kind::View { .. } => unreachable!("base() returns a base"),
        }
    }

    pub fn is_unrealized_const(&self) -> bool {
        let base = self.base();
        base.realized().is_none() && base.op() == Some(Op::Load(LoadOp::Const))
    }

    pub fn is_unrealized_unmasked_const(&self) -> bool {
        self.is_unrealized_const() && self.0.st.views.iter().all(|v| v.mask.is_none())
    }

    pub(crate) fn node_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Whether this base was pinned as a materialization point during
    /// construction.
    pub fn forced_realize(&self) -> bool {
        match &self.0.kind {
            Kind::Base { forced_realize, .. } => forced_realize.get(),
            Kind::View { .. } => false,
        }
    }

    pub(crate) fn set_forced_realize(&self) {
        if let Kind::Base { forced_realize, .. } = &self.0.kind {
            forced_realize.set(true);
        }
    }

    pub(crate) fn contiguous_child(&self) -> Option<(LazyBuffer, ShapeTracker)> {
        match &self.0.kind {
            Kind::Base { contiguous_child, .. } => contiguous_child
                .borrow()
                .as_ref()
                .and_then(|(w, st)| w.upgrade().map(|rc| (LazyBuffer(rc), st.clone()))),
            Kind::View { .. } => None,
        }
    }

    fn set_contiguous_child(&self, child: &LazyBuffer, st: ShapeTracker) {
        if let Kind::Base { contiguous_child, .. } = &self.0.kind {
            *contiguous_child.borrow_mut() = Some((Rc::downgrade(&child.0), st));
        }
    }

    pub(crate) fn set_dtype(&self, dtype: DType) {
        *self.0.dtype.borrow_mut() = dtype;
    }

    pub(crate) fn detach_srcs(&self) {
        if let Kind::Base { srcs, .. } = &self.0.kind {
            *srcs.borrow_mut() = None;
        }
    }

    // === factories ===

    pub fn loadop(
        op: LoadOp,
        shape: &[Dim],
        dtype: DType,
        device: &str,
        arg: Option<OpArg>,
        srcs: &[LazyBuffer],
        enable_cache: bool,
    ) -> Result<LazyBuffer, LazyError> {
        create_lazybuffer(
            device,
            ShapeTracker::from_shape(shape.to_vec()),
            dtype,
            Some(Op::Load(op)),
            arg,
            srcs.iter().cloned().collect(),
            None,
            enable_cache,
        )
    }

    /// A constant with this node's dtype and device, expanded to `shape`
    /// (defaults to this node's shape).
    pub fn const_like(&self, val: ConstValue, shape: Option<&[Dim]>) -> Result<LazyBuffer, LazyError> {
        let shape = shape.unwrap_or_else(|| self.shape());
        Self::const_with(val, self.dtype(), self.device(), shape)
    }

    fn const_with(val: ConstValue, dtype: DType, device: &str, shape: &[Dim]) -> Result<LazyBuffer, LazyError> {
        LazyBuffer::loadop(LoadOp::Const, &[], dtype, device, Some(OpArg::Const(val)), &[], false)?
            .reshape(&vec![Dim::Fixed(1); shape.len()])?
            .expand(shape)
    }

    /// Write `x` in place over this (already realized) buffer.
    pub fn assign(&self, x: &LazyBuffer) -> Result<LazyBuffer, LazyError> {
        if x.size() != self.size() {
            return Err(LazyError::AssignSizeMismatch { dst: self.size(), src: x.size() });
        }
        let arg = if self.0.st.contiguous() { None } else { Some(OpArg::AssignView(self.0.st.clone())) };
        LazyBuffer::loadop(
            LoadOp::Assign,
            self.shape(),
            self.dtype(),
            self.device(),
            arg,
            &[x.clone(), self.base()],
            false,
        )
    }

    pub fn contiguous(&self) -> Result<LazyBuffer, LazyError> {
        if !self.0.st.contiguous() || self.size() != self.base().size() || self.is_unrealized_const() {
            let ret = self.e(Op::Load(LoadOp::Contiguous), &[], None)?;
            if let Some(sti) = self.0.st.invert(self.base().shape()) {
                self.base().set_contiguous_child(&ret, sti);
            }
            return Ok(ret);
        }
        self.base().set_forced_realize();
        Ok(self.clone())
    }

    pub fn cast(&self, dtype: DType, bitcast: bool) -> Result<LazyBuffer, LazyError> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        if self.device().starts_with("DISK") && !bitcast {
            return Err(LazyError::CastOnDiskBuffer);
        }
        if self.is_unrealized_unmasked_const() && !bitcast {
            let val = self.base().const_arg().expect("const node carries a const arg");
            return create_lazybuffer(
                self.device(),
                self.0.st.clone(),
                dtype.clone(),
                Some(Op::Load(LoadOp::Const)),
                Some(OpArg::Const(as_const(val, &dtype))),
                smallvec![],
                None,
                Config::global().lazycache,
            );
        }
        if Config::global().cast_before_view && dtype.itemsize() <= self.dtype().itemsize() && !self.is_base() {
            return self.base().cast(dtype, bitcast)?._view(self.0.st.clone());
        }
        let mut new_shape = self.shape().to_vec();
        if bitcast && self.dtype().itemsize() != dtype.itemsize() {
            if !self.device().starts_with("DISK") {
                return Err(LazyError::ShapeChangingBitcast("only supported on DISK".into()));
            }
            if !all_fixed(&new_shape) {
                return Err(LazyError::ShapeChangingBitcast("symbolic shape is not supported".into()));
            }
            let last = match new_shape.last() {
                Some(d) => d.value(),
                None => return Err(LazyError::ShapeChangingBitcast("requires at least one axis".into())),
            };
            let bytes = last * self.dtype().itemsize();
            if bytes % dtype.itemsize() != 0 {
                return Err(LazyError::ShapeChangingBitcast("trailing axis does not divide".into()));
            }
            *new_shape.last_mut().expect("nonempty") = Dim::Fixed(bytes / dtype.itemsize());
        }
        create_lazybuffer(
            self.device(),
            ShapeTracker::from_shape(new_shape),
            dtype.clone(),
            Some(Op::Unary(UnaryOp::Cast)),
            Some(OpArg::Cast { dtype, bitcast }),
            smallvec![self.clone()],
            None,
            Config::global().lazycache,
        )
    }

    fn copy_node(&self, device: &str) -> Result<LazyBuffer, LazyError> {
        create_lazybuffer(
            device,
            ShapeTracker::from_shape(self.shape().to_vec()),
            self.dtype(),
            Some(Op::Load(LoadOp::Copy)),
            None,
            smallvec![self.clone()],
            None,
            false,
        )
    }

    pub fn copy_to_device(&self, device: &str, force: bool) -> Result<LazyBuffer, LazyError> {
        if self.device() == device {
            return Ok(self.clone());
        }
        // double COPY collapses to one
        let base = self.base();
        if !force
            && self.0.st.contiguous()
            && self.size() == base.size()
            && base.realized().is_none()
            && base.op() == Some(Op::Load(LoadOp::Copy))
        {
            return base.src(0).copy_to_device(device, false)?.reshape(self.shape());
        }
        // consts are rebuilt on the target instead of moved
        if self.is_unrealized_const() {
            let val = base.const_arg().expect("const node carries a const arg");
            return LazyBuffer::loadop(LoadOp::Const, &[], self.dtype(), device, Some(OpArg::Const(val)), &[], false)?
                ._view(self.0.st.clone());
        }
        // a shrinking view copies less after a contiguous
        if prod_dims(self.shape()) < prod_dims(base.st().shape()) {
            return self.contiguous()?.copy_node(device);
        }
        // copy the base, replay the view on the destination
        base.copy_node(device)?._view(self.0.st.clone())
    }

    // === elementwise ===

    pub fn e(&self, op: Op, in_srcs: &[LazyBuffer], arg: Option<OpArg>) -> Result<LazyBuffer, LazyError> {
        // re-fuse through a live CONTIGUOUS child where one was recorded
        let mut srcs: Srcs = smallvec![];
        for s in std::iter::once(self).chain(in_srcs) {
            let via_child = if s.is_base() { s.contiguous_child() } else { None };
            match via_child {
                Some((root, sti)) => srcs.push(root._view(sti)?),
                None => srcs.push(s.clone()),
            }
        }

        let check = if op == Op::Ternary(TernaryOp::Where) { &srcs[1..] } else { &srcs[..] };
        let dts: Vec<DType> = check.iter().map(|x| x.dtype().scalar()).collect();
        if dts.windows(2).any(|w| w[0] != w[1]) {
            return Err(LazyError::DtypeMismatch(format!("{:?} on {:?}", dts, op)));
        }
        if srcs.windows(2).any(|w| w[0].shape() != w[1].shape()) {
            return Err(LazyError::ShapeMismatch(srcs.iter().map(|s| values_of(s.shape())).collect()));
        }
        if op == Op::Ternary(TernaryOp::Where) && srcs[0].dtype() != DType::Bool {
            return Err(LazyError::WherePredicateNotBool);
        }
        if op == Op::Unary(UnaryOp::Neg) && srcs[0].dtype() == DType::Bool {
            return Err(LazyError::NegOnBool);
        }

        let out_dtype = if matches!(op, Op::Binary(BinaryOp::CmpLt) | Op::Binary(BinaryOp::CmpEq)) {
            DType::Bool
        } else {
            srcs.last().expect("at least one operand").dtype()
        };

        // constant folding
        if has_alu(op) && srcs.iter().all(LazyBuffer::is_unrealized_unmasked_const) {
            let operands: Vec<ConstValue> = srcs
                .iter()
                .map(|s| s.base().const_arg().expect("const node carries a const arg"))
                .collect();
            return Self::const_with(exec_alu(op, &out_dtype, &operands), out_dtype, self.device(), self.shape());
        }

        // identity simplifications
        if let Op::Binary(bop) = op {
            let x = self;
            let y = &in_srcs[0];
            match bop {
                BinaryOp::Add => {
                    if y.uu_const_val().is_some_and(|v| v.is_zero()) {
                        return Ok(x.clone());
                    }
                    if x.uu_const_val().is_some_and(|v| v.is_zero()) {
                        return Ok(y.clone());
                    }
                }
                BinaryOp::Sub => {
                    if y.uu_const_val().is_some_and(|v| v.is_zero()) {
                        return Ok(x.clone());
                    }
                }
                BinaryOp::Mul => {
                    if let Some(v) = x.uu_const_val() {
                        if v.is_one() {
                            return Ok(y.clone());
                        }
                        if v.is_zero() {
                            return y.const_like(ConstValue::Int(0), None);
                        }
                    }
                    if let Some(v) = y.uu_const_val() {
                        if v.is_one() {
                            return Ok(x.clone());
                        }
                        if v.is_zero() {
                            return x.const_like(ConstValue::Int(0), None);
                        }
                    }
                }
                BinaryOp::Div => {
                    if x.dtype().is_float() {
                        if let Some(v) = y.uu_const_val() {
                            if !v.is_zero() {
                                let recip = x.const_like(ConstValue::Float(1.0 / v.as_f64()), None)?;
                                return x.e(Op::Binary(BinaryOp::Mul), &[recip], None);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        create_lazybuffer(
            self.device(),
            ShapeTracker::from_shape(self.shape().to_vec()),
            out_dtype,
            Some(op),
            arg,
            srcs,
            None,
            Config::global().lazycache,
        )
    }

    fn uu_const_val(&self) -> Option<ConstValue> {
        if self.is_unrealized_unmasked_const() {
            self.base().const_arg()
        } else {
            None
        }
    }

    // === reduce ===

    fn reduce_op(&self, op: ReduceOp, axes: &[usize]) -> Result<LazyBuffer, LazyError> {
        let axes: Vec<usize> = axes.iter().copied().filter(|&i| self.shape()[i].value() != 1).collect();
        if axes.is_empty() {
            return Ok(self.clone());
        }
        let new_shape: Vec<Dim> = self
            .shape()
            .iter()
            .enumerate()
            .map(|(i, d)| if axes.contains(&i) { Dim::Fixed(1) } else { d.clone() })
            .collect();
        create_lazybuffer(
            self.device(),
            ShapeTracker::from_shape(new_shape),
            self.dtype(),
            Some(Op::Reduce(op)),
            Some(OpArg::Axes(axes)),
            smallvec![self.clone()],
            None,
            Config::global().lazycache,
        )
    }

    pub fn r(&self, op: ReduceOp, axes: &[usize]) -> Result<LazyBuffer, LazyError> {
        let ndim = self.shape().len();
        if let Some(&axis) = axes.iter().find(|&&a| a >= ndim) {
            return Err(LazyError::AxisOutOfRange { axis, ndim });
        }
        let new_shape: Vec<Dim> = self
            .shape()
            .iter()
            .enumerate()
            .map(|(i, d)| if axes.contains(&i) { Dim::Fixed(1) } else { d.clone() })
            .collect();

        // reducing nothing yields the reduction identity
        if self.size() == 0 && !new_shape.iter().any(|d| d.value() == 0) {
            let ident = match (op, self.dtype()) {
                (ReduceOp::Sum, _) => ConstValue::Int(0),
                (ReduceOp::Max, d) if d.is_float() => ConstValue::Float(f64::NEG_INFINITY),
                (ReduceOp::Max, DType::Bool) => ConstValue::Bool(false),
                (ReduceOp::Max, _) => ConstValue::Int(i64::MIN),
            };
            return self.const_like(ident, Some(&new_shape));
        }

        // closed form over an unmasked const
        if self.is_unrealized_unmasked_const() {
            let val = self.base().const_arg().expect("const node carries a const arg");
            let folded = match op {
                ReduceOp::Sum => {
                    let n: usize = axes.iter().map(|&i| self.shape()[i].value()).product();
                    match val {
                        ConstValue::Float(f) => ConstValue::Float(f * n as f64),
                        other => ConstValue::Int(other.as_i64().wrapping_mul(n as i64)),
                    }
                }
                ReduceOp::Max => val,
            };
            return self.const_like(folded, Some(&new_shape));
        }

        let cfg = Config::global();
        let shape = self.shape();
        if !cfg.split_reduceop
            || !all_fixed(shape)
            || shape.iter().any(|d| d.value() == 0)
            || prod_dims(shape) / prod_dims(&new_shape) < cfg.reduceop_split_threshold
        {
            return self.reduce_op(op, axes);
        }

        // pick the reduced axis that splits best: large power-of-two divisor,
        // small stride
        let strides = self.0.st.real_strides();
        let mut best: Option<(f64, usize, usize)> = None;
        for (i, (d, stri)) in shape.iter().zip(&strides).enumerate() {
            if !axes.contains(&i) {
                continue;
            }
            let divisor = gcd(256, d.value());
            let denom = match stri {
                Some(0) | None => f64::INFINITY,
                Some(s) => *s as f64,
            };
            let heuristic = divisor as f64 / denom;
            let candidate = (heuristic, divisor, i);
            if best.map_or(true, |b| candidate > b) {
                best = Some(candidate);
            }
        }
        let (heuristic, divisor, dim_to_split) = best.expect("reduce has at least one non-unit axis");
        if divisor < 16 || heuristic < 0.1 {
            return self.reduce_op(op, axes);
        }

        let splitted_shape = |mid: &[Dim]| -> Vec<Dim> {
            let s = shape[dim_to_split].value();
            let mut out = shape[..dim_to_split].to_vec();
            out.push(Dim::Fixed(s / divisor));
            out.extend_from_slice(mid);
            out.extend_from_slice(&shape[dim_to_split + 1..]);
            out
        };
        self.reshape(&splitted_shape(&[Dim::Fixed(divisor)]))?
            .reduce_op(op, &[dim_to_split + 1])?
            .reshape(&splitted_shape(&[]))?
            .reduce_op(op, axes)
    }

    // === movement ===

    fn _view(&self, new_st: ShapeTracker) -> Result<LazyBuffer, LazyError> {
        if self.0.st.size() == 0 || new_st.top_mask_is_empty() {
            return Self::const_with(ConstValue::Int(0), self.dtype(), self.device(), new_st.shape());
        }
        if new_st.contiguous() && self.base().shape() == new_st.shape() {
            return Ok(self.base());
        }
        create_lazybuffer(
            self.device(),
            new_st,
            self.dtype(),
            None,
            None,
            smallvec![],
            Some(self.base()),
            Config::global().lazycache,
        )
    }

    pub fn reshape(&self, shape: &[Dim]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.reshape(shape)?)
    }

    pub fn pad(&self, padding: &[(usize, usize)]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.pad(padding)?)
    }

    pub fn expand(&self, shape: &[Dim]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.expand(shape)?)
    }

    pub fn permute(&self, axes: &[usize]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.permute(axes)?)
    }

    pub fn shrink(&self, ranges: &[(usize, usize)]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.shrink(ranges)?)
    }

    pub fn stride(&self, mul: &[isize]) -> Result<LazyBuffer, LazyError> {
        self._view(self.0.st.stride(mul)?)
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use shape::dims_of;

    const DEV: &str = "CPU";

    fn empty(shape: &[usize]) -> LazyBuffer {
        LazyBuffer::loadop(LoadOp::Empty, &dims_of(shape), DType::Float32, DEV, None, &[], false).unwrap()
    }

    fn realized(shape: &[usize]) -> LazyBuffer {
        let b = empty(shape);
        b.detach_srcs();
        b
    }

    fn fconst(v: f64, shape: &[usize]) -> LazyBuffer {
        LazyBuffer::loadop(LoadOp::Const, &[], DType::Float32, DEV, Some(OpArg::Const(ConstValue::Float(v))), &[], false)
            .unwrap()
            .reshape(&vec![Dim::Fixed(1); shape.len()])
            .unwrap()
            .expand(&dims_of(shape))
            .unwrap()
    }

    #[test]
    fn test_add_zero_is_identity() {
        let x = realized(&[4, 4]);
        let zero = x.const_like(ConstValue::Int(0), None).unwrap();
        let out = x.e(Op::Binary(BinaryOp::Add), &[zero.clone()], None).unwrap();
        assert_eq!(out, x);
        let out = zero.e(Op::Binary(BinaryOp::Add), &[x.clone()], None).unwrap();
        assert_eq!(out, x);
        let out = x.e(Op::Binary(BinaryOp::Sub), &[zero], None).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn test_mul_identities() {
        let x = realized(&[4]);
        let one = x.const_like(ConstValue::Int(1), None).unwrap();
        let zero = x.const_like(ConstValue::Int(0), None).unwrap();
        assert_eq!(x.e(Op::Binary(BinaryOp::Mul), &[one.clone()], None).unwrap(), x);
        assert_eq!(one.e(Op::Binary(BinaryOp::Mul), &[x.clone()], None).unwrap(), x);
        let z = x.e(Op::Binary(BinaryOp::Mul), &[zero.clone()], None).unwrap();
        assert!(z.is_unrealized_unmasked_const());
        assert_eq!(z.base().const_arg().unwrap(), ConstValue::Float(0.0));
        assert!(zero.e(Op::Binary(BinaryOp::Mul), &[x], None).unwrap().is_unrealized_unmasked_const());
    }

    #[test]
    fn test_div_by_const_becomes_mul() {
        let x = realized(&[8]);
        let four = x.const_like(ConstValue::Float(4.0), None).unwrap();
        let out = x.e(Op::Binary(BinaryOp::Div), &[four], None).unwrap();
        assert_eq!(out.base().op(), Some(Op::Binary(BinaryOp::Mul)));
        let srcs = out.base().srcs_vec();
        assert_eq!(srcs[1].base().const_arg().unwrap(), ConstValue::Float(0.25));
    }

    #[test]
    fn test_const_folding_collapses_subtree() {
        let a = fconst(3.0, &[2, 2]);
        let b = fconst(4.0, &[2, 2]);
        let sum = a.e(Op::Binary(BinaryOp::Add), &[b], None).unwrap();
        assert!(sum.is_unrealized_unmasked_const());
        assert_eq!(sum.base().const_arg().unwrap(), ConstValue::Float(7.0));
    }

    #[test]
    fn test_elementwise_contract_checks() {
        let x = realized(&[4]);
        let y = realized(&[5]);
        assert!(matches!(
            x.e(Op::Binary(BinaryOp::Add), &[y], None),
            Err(LazyError::ShapeMismatch(_))
        ));
        let b = LazyBuffer::loadop(LoadOp::Empty, &dims_of(&[4]), DType::Bool, DEV, None, &[], false).unwrap();
        assert!(matches!(b.e(Op::Unary(UnaryOp::Neg), &[], None), Err(LazyError::NegOnBool)));
        let f = realized(&[4]);
        assert!(matches!(
            f.e(Op::Ternary(TernaryOp::Where), &[realized(&[4]), realized(&[4])], None),
            Err(LazyError::WherePredicateNotBool)
        ));
    }

    #[test]
    fn test_structural_cache_dedup() {
        let x = realized(&[4]);
        let y = realized(&[4]);
        let a = x.e(Op::Binary(BinaryOp::Add), &[y.clone()], None).unwrap();
        let b = x.e(Op::Binary(BinaryOp::Add), &[y], None).unwrap();
        assert_eq!(a, b); // same node identity while both are live
    }

    #[test]
    fn test_zero_size_becomes_const() {
        let z = empty(&[0, 4]);
        assert_eq!(z.op(), Some(Op::Load(LoadOp::Const)));
        assert!(z.srcs_vec().is_empty());
    }

    #[test]
    fn test_view_collapses_to_base() {
        let x = realized(&[2, 3]);
        let v = x.reshape(&dims_of(&[6])).unwrap();
        assert!(!v.is_base());
        let back = v.reshape(&dims_of(&[2, 3])).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn test_reduce_drops_unit_axes() {
        let x = realized(&[1, 8]);
        let r = x.r(ReduceOp::Sum, &[0]).unwrap();
        assert_eq!(r, x); // reducing a size-1 axis is the identity
    }

    #[test]
    fn test_reduce_const_closed_form() {
        let c = fconst(2.0, &[4, 8]);
        let r = c.r(ReduceOp::Sum, &[0, 1]).unwrap();
        assert!(r.is_unrealized_unmasked_const());
        assert_eq!(r.base().const_arg().unwrap(), ConstValue::Float(64.0));
        assert_eq!(values_of(r.shape()), vec![1, 1]);
        let m = c.r(ReduceOp::Max, &[1]).unwrap();
        assert_eq!(m.base().const_arg().unwrap(), ConstValue::Float(2.0));
    }

    #[test]
    fn test_split_reduce_two_stage() {
        let x = realized(&[65536]);
        let r = x.r(ReduceOp::Sum, &[0]).unwrap();
        assert_eq!(values_of(r.shape()), vec![1]);
        // final reduce feeds on a reshape of the partial reduce
        let base = r.base();
        assert_eq!(base.op(), Some(Op::Reduce(ReduceOp::Sum)));
        let inner = base.src(0).base();
        assert_eq!(inner.op(), Some(Op::Reduce(ReduceOp::Sum)));
        assert_eq!(values_of(inner.shape()), vec![256, 1]);
    }

    #[test]
    fn test_small_reduce_is_single_stage() {
        let x = realized(&[64, 4]);
        let r = x.r(ReduceOp::Sum, &[0]).unwrap();
        let base = r.base();
        assert_eq!(base.op(), Some(Op::Reduce(ReduceOp::Sum)));
        assert_eq!(base.src(0), x);
    }

    #[test]
    fn test_assign_requires_realized_target() {
        let x = empty(&[4]);
        let y = empty(&[4]);
        assert!(matches!(x.assign(&y), Err(LazyError::UnrealizedAssignTarget)));
        let r = realized(&[4]);
        let a = r.assign(&y).unwrap();
        assert_eq!(a.op(), Some(Op::Load(LoadOp::Assign)));
        // assign shares the target's buffer slot
        assert!(Rc::ptr_eq(&a.buffer(), &r.buffer()));
    }

    #[test]
    fn test_assign_size_mismatch() {
        let r = realized(&[4]);
        let y = empty(&[5]);
        assert!(matches!(r.assign(&y), Err(LazyError::AssignSizeMismatch { .. })));
    }

    #[test]
    fn test_cast_identity_and_const() {
        let x = realized(&[4]);
        assert_eq!(x.cast(DType::Float32, false).unwrap(), x);
        let c = fconst(1.5, &[4]);
        let i = c.cast(DType::Int32, false).unwrap();
        assert!(i.is_unrealized_unmasked_const());
        assert_eq!(i.base().const_arg().unwrap(), ConstValue::Int(1));
        assert_eq!(i.dtype(), DType::Int32);
    }

    #[test]
    fn test_copy_collapse_and_const_copy() {
        let x = realized(&[4]);
        let once = x.copy_to_device("GPU", false).unwrap();
        assert_eq!(once.base().op(), Some(Op::Load(LoadOp::Copy)));
        let twice = once.copy_to_device("CLANG", false).unwrap();
        // the chained copy reads from the original source
        assert_eq!(twice.base().op(), Some(Op::Load(LoadOp::Copy)));
        assert_eq!(twice.base().src(0), x);

        let c = fconst(3.0, &[4]);
        let moved = c.copy_to_device("GPU", false).unwrap();
        assert!(moved.is_unrealized_const());
        assert_eq!(moved.device(), "GPU");
    }

    #[test]
    fn test_contiguous_on_contiguous_forces_realize() {
        let x = realized(&[4]);
        let y = x.e(Op::Binary(BinaryOp::Add), &[x.clone()], None).unwrap();
        let c = y.contiguous().unwrap();
        assert_eq!(c, y);
        assert!(y.base().forced_realize());
    }

    #[test]
    fn test_contiguous_child_hint_refuses_realize() {
        let x = realized(&[2, 3]);
        let p = x.permute(&[1, 0]).unwrap();
        let c = p.contiguous().unwrap();
        assert_eq!(c.base().op(), Some(Op::Load(LoadOp::Contiguous)));
        // the base recorded the hint
        assert!(x.contiguous_child().is_some());
        // an elementwise use of the base now routes through the child
        let out = x.e(Op::Unary(UnaryOp::Neg), &[], None).unwrap();
        let src = out.base().src(0);
        assert_eq!(src.base(), c.base());
    }

    #[test]
    fn test_masked_view_annihilation() {
        let x = realized(&[4]);
        let gone = x.pad(&[(2, 0)]).unwrap().shrink(&[(0, 2)]).unwrap();
        assert!(gone.is_unrealized_const());
    }
}
