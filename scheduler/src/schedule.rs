//! The scheduler: turns a set of output LazyBuffers into an ordered list of
//! fused kernels.
//!
//! Four passes over the graph:
//! 1. discovery (`recurse_lb`): find every base, decide which must materialize
//! 2. pad-safety: promote padded nodes whose producers cannot absorb zero padding
//! 3. reduce grouping (`reduce_for_op`): pair each reduce with its single
//!    elementwise sink, or force-realize it
//! 4. AST construction + Kahn's algorithm over realize targets, with extra
//!    edges so every reader of a pre-assign value runs before the assign

use crate::buffer::Buffer;
use crate::config::Config;
use crate::dtype::DType;
use crate::error::ScheduleError;
use crate::lazy::LazyBuffer;
use crate::ops::{
    is_unsafe_pad_op, BufferOp, ConstBuffer, LazyOp, LoadOp, MemBuffer, Op, OpArg, ScheduleItem,
};
use fxhash::{FxBuildHasher, FxHashMap, FxHashSet};
use indexmap::{IndexMap, IndexSet};
use log::debug;
use shape::{all_fixed, prod_dims, values_of, ShapeTracker, Variable};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

/// Merged variable bindings of a schedule. IndexMap keeps merge order
/// deterministic.
pub type VarVals = IndexMap<Variable, usize>;

type LbSet = IndexSet<LazyBuffer, FxBuildHasher>;
type LbMap<V> = IndexMap<LazyBuffer, V, FxBuildHasher>;
type Children = LbMap<LbMap<()>>;

// schedule items keep LazyBuffers until after the toposort because of ASSIGN
struct LbScheduleItem {
    ast: Vec<LazyOp>,
    outputs: Vec<LazyBuffer>,
    inputs: Vec<LazyBuffer>,
    var_vals: VarVals,
}

fn merge_var_vals(dst: &mut VarVals, src: impl IntoIterator<Item = (Variable, usize)>) {
    for (var, val) in src {
        dst.insert(var, val);
    }
}

/// Lower the subgraph under `buf` into a LazyOp tree, assigning load indices
/// as new inputs are discovered (index 0 is the output).
#[allow(clippy::too_many_arguments)]
fn recursive_lazyop(
    buf: &LazyBuffer,
    membufs: &mut Vec<LazyBuffer>,
    outbufs: &[LazyBuffer],
    var_vals: &mut VarVals,
    st: ShapeTracker,
    realizes: &LbSet,
    cache: &mut FxHashMap<(usize, ShapeTracker), LazyOp>,
    assign_to: Option<&LazyBuffer>,
    assign_idx: Option<usize>,
) -> Result<LazyOp, ScheduleError> {
    if let Some(hit) = cache.get(&(buf.node_id(), st.clone())) {
        return Ok(hit.clone());
    }
    let (buf, st) = if buf.is_base() {
        (buf.clone(), st)
    } else {
        (buf.base(), buf.st().compose(&st))
    };
    let op = buf.op().expect("base node carries an op");

    // consts are always fused and generated in the kernel
    if op == Op::Load(LoadOp::Const) {
        let (unbound_st, vals) = st.simplify().unbind();
        merge_var_vals(var_vals, vals);
        let val = buf.const_arg().expect("const node carries a const arg");
        return Ok(LazyOp::new(
            Op::Buffer(BufferOp::Const),
            &[],
            Some(OpArg::ConstBuf(ConstBuffer { val, dtype: buf.dtype(), st: unbound_st })),
        ));
    }

    // not fused: load it and record the input
    if buf.realized().is_some() || (realizes.contains(&buf) && !outbufs.contains(&buf)) {
        let (unbound_st, vals) = st.simplify().unbind();
        merge_var_vals(var_vals, vals);
        if assign_to.is_some_and(|t| *t == buf) {
            let idx = assign_idx.expect("assign target comes with an index");
            if !unbound_st.contiguous() {
                // also allow a masked view that is equal to a contiguous shrink
                // of the same mask (single-view masks only)
                let equivalent_shrink = unbound_st.views.len() == 1
                    && unbound_st.views[0].mask.is_some()
                    && {
                        let mask = unbound_st.views[0].mask.clone().expect("checked");
                        let contig = ShapeTracker::from_shape(unbound_st.shape().to_vec());
                        contig.shrink(&mask).ok() == unbound_st.shrink(&mask).ok()
                    };
                if !equivalent_shrink {
                    return Err(ScheduleError::NonContiguousAssign(format!("{:?}", unbound_st)));
                }
            }
            return Ok(LazyOp::new(
                Op::Buffer(BufferOp::Load),
                &[],
                Some(OpArg::Mem(MemBuffer { idx, dtype: buf.dtype(), st: unbound_st })),
            ));
        }
        let idx = match membufs.iter().position(|m| m == &buf) {
            Some(i) => i,
            None => {
                membufs.push(buf.clone());
                membufs.len() - 1
            }
        };
        return Ok(LazyOp::new(
            Op::Buffer(BufferOp::Load),
            &[],
            Some(OpArg::Mem(MemBuffer { idx, dtype: buf.dtype(), st: unbound_st })),
        ));
    }

    // a CONTIGUOUS that reached its own kernel is transparent
    if op == Op::Load(LoadOp::Contiguous) {
        debug_assert!(outbufs.contains(&buf));
        return recursive_lazyop(&buf.src(0), membufs, outbufs, var_vals, st, realizes, cache, None, None);
    }

    // an ASSIGN at the output recurses into its source with the target active
    if op == Op::Load(LoadOp::Assign) {
        debug_assert!(outbufs.contains(&buf));
        let target = buf.src(1);
        if !target.is_base() {
            return Err(ScheduleError::Internal("assign must be to a base".into()));
        }
        if target.realized().is_none() {
            return Err(ScheduleError::Internal(format!(
                "assign target must be realized to schedule {:?}",
                target
            )));
        }
        let idx = membufs
            .iter()
            .position(|m| m == &buf)
            .expect("assign output is in membufs");
        return recursive_lazyop(
            &buf.src(0),
            membufs,
            outbufs,
            var_vals,
            st,
            realizes,
            cache,
            Some(&target),
            Some(idx),
        );
    }

    // a reduce restarts the tracker at its input shape (late-fusion invariant)
    let st = if let Op::Reduce(_) = op {
        if !st.contiguous() {
            return Err(ScheduleError::Internal(format!(
                "reduce late fusion must be contiguous {:?}",
                st
            )));
        }
        ShapeTracker::from_shape(buf.src(0).shape().to_vec())
    } else {
        st
    };

    // fuse
    let mut children = Vec::new();
    for x in buf.srcs_vec() {
        children.push(recursive_lazyop(
            &x, membufs, outbufs, var_vals, st.clone(), realizes, cache, assign_to, assign_idx,
        )?);
    }
    let ret = LazyOp::new(op, &children, buf.arg());
    cache.insert((buf.node_id(), st), ret.clone());
    Ok(ret)
}

fn schedule_one(
    out: &LazyBuffer,
    realizes: &LbSet,
    reduce_for_op: &LbMap<LazyBuffer>,
) -> Result<LbScheduleItem, ScheduleError> {
    let mut var_vals: VarVals = VarVals::default();
    merge_var_vals(&mut var_vals, out.st().var_vals());

    let op = out.op().expect("realize target is a base");
    if matches!(op, Op::Load(LoadOp::Custom | LoadOp::Copy | LoadOp::Empty)) {
        // the scheduler does not fuse these; emit them as-is
        return Ok(LbScheduleItem {
            ast: vec![LazyOp::new(op, &[], out.arg())],
            outputs: vec![out.clone()],
            inputs: out.srcs_vec().to_vec(),
            var_vals,
        });
    }

    let output_shape = match reduce_for_op.get(out) {
        Some(r) => r.shape().to_vec(),
        None => out.shape().to_vec(),
    };
    let output_st = ShapeTracker::from_shape(output_shape);
    let output_view = match (op, out.arg()) {
        (Op::Load(LoadOp::Assign), Some(OpArg::AssignView(st))) => st,
        _ => output_st.clone(),
    };
    let mut membufs = vec![out.clone()];
    let mut cache = FxHashMap::default();
    let inner = recursive_lazyop(
        out,
        &mut membufs,
        std::slice::from_ref(out),
        &mut var_vals,
        output_st,
        realizes,
        &mut cache,
        None,
        None,
    )?;
    let (output_view, vals) = output_view.simplify().unbind();
    merge_var_vals(&mut var_vals, vals);
    let store = LazyOp::new(
        Op::Buffer(BufferOp::Store),
        &[inner],
        Some(OpArg::Mem(MemBuffer { idx: 0, dtype: out.dtype(), st: output_view })),
    );
    Ok(LbScheduleItem {
        ast: vec![store],
        outputs: vec![out.clone()],
        inputs: membufs[1..].to_vec(),
        var_vals,
    })
}

/// Depth-first discovery: collect every base, mark realize points at load
/// ops, expand boundaries and forced realizes, and build the consumer map.
fn recurse_lb(
    buf: &LazyBuffer,
    realizes: &mut LbSet,
    allbufs: &mut LbMap<()>,
    simple_pads: &mut LbSet,
    children: &mut Children,
    scheduled: bool,
) {
    if allbufs.contains_key(buf) || buf.base().realized().is_some() {
        return;
    }
    let cfg = Config::global();
    if cfg.graph {
        debug!("graph: visit {:?} scheduled={}", buf, scheduled);
    }

    // image dtypes that cannot satisfy the layout fall back to float32
    if let DType::Image(im) = buf.dtype() {
        let fits = prod_dims(buf.shape()) == im.pixels()
            && buf
                .st()
                .unit_stride_axes()
                .iter()
                .any(|&x| buf.shape()[x].value() % 4 == 0);
        if !fits {
            if cfg.debug >= 3 {
                debug!("forcing image {:?} with shape {:?} to float32", im, values_of(buf.shape()));
            }
            buf.set_dtype(DType::Float32);
            if buf.is_base() {
                buf.buffer().force_dtype(DType::Float32);
            }
        }
    }

    if !buf.is_base() {
        let base = buf.base();
        // realize places where the buffer is expanded, unless a simple mask
        // accounts for the growth (checked for pad safety afterwards)
        if prod_dims(base.st().shape()) < prod_dims(buf.st().shape()) {
            let simple = buf.st().views.len() == 1
                && buf.st().views.last().is_some_and(|v| v.mask.is_some())
                && all_fixed(base.st().shape())
                && prod_dims(base.st().shape())
                    >= buf.st().views.last().expect("nonempty").mask.as_ref().expect("checked")
                        .iter()
                        .map(|&(lo, hi)| hi - lo)
                        .product();
            if simple {
                simple_pads.insert(base.clone());
            } else {
                realizes.insert(base.clone());
            }
        }
        return recurse_lb(&base, realizes, allbufs, simple_pads, children, false);
    }

    if buf.forced_realize() {
        realizes.insert(buf.clone());
    }
    allbufs.insert(buf.clone(), ());
    if let Some(Op::Load(lop)) = buf.op() {
        realizes.insert(buf.clone());
        if lop == LoadOp::Copy {
            let src = buf.src(0);
            assert!(
                src.st().contiguous() && src.size() == src.base().size(),
                "can only copy contig"
            );
            realizes.insert(src.base());
        }
    }
    for x in buf.srcs_vec() {
        children.entry(x.base()).or_default().insert(buf.clone(), ());
        recurse_lb(&x, realizes, allbufs, simple_pads, children, false);
    }
}

/// Zero padding may flow through a node only if nothing beneath it (up to a
/// realize boundary) computes an op that zero changes.
fn is_padding_okay(buf: &LazyBuffer, realizes: &LbSet) -> bool {
    if realizes.contains(buf) || buf.realized().is_some() {
        return true;
    }
    if buf.op().is_some_and(is_unsafe_pad_op) {
        return false;
    }
    buf.srcs_vec().iter().all(|x| is_padding_okay(&x.base(), realizes))
}

fn logops_sink() -> Option<&'static Mutex<File>> {
    static SINK: OnceLock<Option<Mutex<File>>> = OnceLock::new();
    SINK.get_or_init(|| {
        Config::global().logops.as_ref().and_then(|path| {
            OpenOptions::new().create(true).append(true).open(path).ok().map(Mutex::new)
        })
    })
    .as_ref()
}

/// Produce the ordered schedule for `outs` plus the merged variable bindings.
///
/// `seen` carries LazyBuffers scheduled by earlier calls; everything scheduled
/// here is added to it.
pub fn create_schedule_with_vars(
    outs: &[LazyBuffer],
    seen: Option<&mut FxHashSet<LazyBuffer>>,
) -> Result<(Vec<ScheduleItem>, VarVals), ScheduleError> {
    let mut local_seen = FxHashSet::default();
    let seen = match seen {
        Some(s) => s,
        None => &mut local_seen,
    };
    let cfg = Config::global();

    // start by realizing the outputs themselves
    let mut realizes: LbSet = outs
        .iter()
        .map(LazyBuffer::base)
        .filter(|b| b.realized().is_none())
        .collect();
    let mut allbufs: LbMap<()> = LbMap::default();
    let mut simple_pads = LbSet::default();
    let mut children = Children::default();
    for out in outs {
        recurse_lb(&out.base(), &mut realizes, &mut allbufs, &mut simple_pads, &mut children, true);
    }

    // promote padded nodes whose producers are unsafe under zero padding
    for p in simple_pads.clone() {
        if !is_padding_okay(&p, &realizes) {
            realizes.insert(p);
        }
    }

    // pair each reduce with a single elementwise sink, or force-realize it
    let mut reduce_for_op: LbMap<LazyBuffer> = LbMap::default();
    let all: Vec<LazyBuffer> = allbufs.keys().cloned().collect();
    for r in all {
        if !r.op().is_some_and(|op| op.is_reduce()) || realizes.contains(&r) {
            continue;
        }

        // follow the reduce down through its consumers
        let mut child_set: LbMap<ShapeTracker> = LbMap::default();
        child_set.insert(r.clone(), r.st().clone());
        let mut realized_children: LbMap<ShapeTracker> = LbMap::default();
        let mut forced_realize = false;
        let mut can_chase = true;
        while !forced_realize && !child_set.is_empty() {
            let mut next_child_set: LbMap<ShapeTracker> = LbMap::default();
            for (tr, st) in &child_set {
                if realizes.contains(tr) {
                    realized_children.insert(tr.clone(), st.clone());
                    // one output buffer, contiguous, size-preserving, and not
                    // already bound to a different reduce
                    if realized_children.len() > 1
                        || !st.contiguous()
                        || st.size() != r.st().size()
                        || reduce_for_op.get(tr).is_some_and(|rr| rr != &r)
                    {
                        can_chase = reduce_for_op.get(tr).map_or(true, |rr| rr == &r);
                        forced_realize = true;
                        break;
                    }
                    continue;
                }
                let Some(kids) = children.get(tr) else { continue };
                for tr_next in kids.keys() {
                    if tr_next.realized().is_some() {
                        continue;
                    }
                    // max one reduce per kernel
                    if tr_next.op().is_some_and(|op| op.is_reduce()) {
                        forced_realize = true;
                        break;
                    }
                    let st_childs = dedup_srcs_of(tr_next, tr);
                    if st_childs.len() > 1 {
                        forced_realize = true;
                        break;
                    }
                    next_child_set.insert(tr_next.clone(), st.compose(st_childs[0].st()));
                }
            }
            child_set = next_child_set;
        }
        if forced_realize {
            let mut tr = r.clone();
            if can_chase {
                // chase down the unique-child chain as far as contiguity holds
                let mut st = tr.st().clone();
                loop {
                    let Some(kids) = children.get(&tr) else { break };
                    if kids.len() != 1 {
                        break;
                    }
                    let tr_next = kids.keys().next().expect("len checked").clone();
                    let st_childs = dedup_srcs_of(&tr_next, &tr);
                    if st_childs.len() > 1 {
                        break;
                    }
                    if st.size() != st_childs[0].st().size() {
                        break;
                    }
                    st = st.compose(st_childs[0].st());
                    if !st.contiguous() || tr_next.op().is_some_and(|op| op.is_reduce()) {
                        break;
                    }
                    tr = tr_next;
                }
                reduce_for_op.insert(tr.clone(), r.clone());
            }
            realizes.insert(tr);
        } else {
            debug_assert_eq!(realized_children.len(), 1);
            let sink = realized_children.keys().next().expect("exactly one").clone();
            reduce_for_op.insert(sink, r.clone());
        }
    }

    // preschedule every realize target
    let mut prescheduled: LbMap<LbScheduleItem> = LbMap::default();
    for x in realizes.iter() {
        if !seen.contains(x) && x.realized().is_none() && x.op() != Some(Op::Load(LoadOp::Const)) {
            prescheduled.insert(x.clone(), schedule_one(x, &realizes, &reduce_for_op)?);
        }
    }
    let mut schedule_targets: FxHashMap<LazyBuffer, LazyBuffer> = FxHashMap::default();
    for (key, lsi) in &prescheduled {
        for out in &lsi.outputs {
            schedule_targets.insert(out.clone(), key.clone());
        }
    }
    let mut assign_targets: FxHashMap<LazyBuffer, LazyBuffer> = FxHashMap::default();
    for x in realizes.iter() {
        if x.op() == Some(Op::Load(LoadOp::Assign)) && !seen.contains(x) && x.realized().is_none() {
            assign_targets.insert(x.src(1), x.clone());
        }
    }

    // breadth-first ordering
    let mut graph: FxHashMap<LazyBuffer, Vec<LazyBuffer>> = FxHashMap::default();
    let mut in_degree: FxHashMap<LazyBuffer, usize> = FxHashMap::default();
    for (key, lsi) in &prescheduled {
        // realize outputs after all parents are realized
        let parents: IndexSet<LazyBuffer, FxBuildHasher> = lsi
            .inputs
            .iter()
            .filter_map(|x| schedule_targets.get(x).cloned())
            .collect();
        for parent in parents {
            graph.entry(parent).or_default().push(key.clone());
            *in_degree.entry(key.clone()).or_insert(0) += 1;
        }
        // realize outputs before a parent is assigned to
        let parent_assigns: IndexSet<LazyBuffer, FxBuildHasher> = lsi
            .inputs
            .iter()
            .filter_map(|x| assign_targets.get(x))
            .map(|a| schedule_targets[a].clone())
            .collect();
        for assign in parent_assigns {
            graph.entry(key.clone()).or_default().push(assign.clone());
            *in_degree.entry(assign).or_insert(0) += 1;
        }
        // a scheduled node cannot be scheduled again
        for out in &lsi.outputs {
            out.detach_srcs();
        }
    }

    let mut queue: VecDeque<LazyBuffer> = prescheduled
        .keys()
        .filter(|k| in_degree.get(*k).copied().unwrap_or(0) == 0)
        .cloned()
        .collect();
    let mut schedule: Vec<ScheduleItem> = Vec::new();
    let mut var_vals = VarVals::default();
    let mut kernel_number = 0usize;
    while let Some(key) = queue.pop_front() {
        let ps = &prescheduled[&key];
        for out in &ps.outputs {
            seen.insert(out.clone());
        }
        if cfg.graph {
            kernel_number += 1;
            for out in &ps.outputs {
                debug!("graph: realized {:?} in kernel {}", out, kernel_number);
            }
        }
        merge_var_vals(&mut var_vals, ps.var_vals.clone());
        let item = ScheduleItem {
            ast: ps.ast.clone(),
            outputs: collect_buffers(&ps.outputs),
            inputs: collect_buffers(&ps.inputs),
        };
        if let Some(sink) = logops_sink() {
            if !item.ast[0].op().is_load() && !item.inputs.iter().any(|i| i.device().starts_with("DISK:")) {
                if let Ok(mut f) = sink.lock() {
                    let _ = writeln!(f, "{:?}", item.ast);
                    let _ = f.flush();
                }
            }
        }
        schedule.push(item);
        if let Some(nexts) = graph.get(&key) {
            for x in nexts {
                let deg = in_degree.get_mut(x).expect("edge target has a degree");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(x.clone());
                }
            }
        }
    }

    if in_degree.values().any(|&d| d > 0) || prescheduled.len() != schedule.len() {
        return Err(ScheduleError::Internal(format!(
            "cycle detected in graph, prescheduled {} but only scheduled {}",
            prescheduled.len(),
            schedule.len()
        )));
    }
    Ok((schedule, var_vals))
}

/// Like [`create_schedule_with_vars`], for graphs with no free variables.
pub fn create_schedule(
    outs: &[LazyBuffer],
    seen: Option<&mut FxHashSet<LazyBuffer>>,
) -> Result<Vec<ScheduleItem>, ScheduleError> {
    let (schedule, var_vals) = create_schedule_with_vars(outs, seen)?;
    if !var_vals.is_empty() {
        return Err(ScheduleError::Internal(format!(
            "schedule should not have variables {:?}",
            var_vals.keys().collect::<Vec<_>>()
        )));
    }
    Ok(schedule)
}

fn dedup_srcs_of(consumer: &LazyBuffer, base: &LazyBuffer) -> Vec<LazyBuffer> {
    let mut out: Vec<LazyBuffer> = Vec::new();
    for s in consumer.srcs_vec() {
        if &s.base() == base && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

fn collect_buffers(bufs: &[LazyBuffer]) -> Vec<Rc<Buffer>> {
    bufs.iter().filter(|x| x.size() != 0).map(LazyBuffer::buffer).collect()
}
