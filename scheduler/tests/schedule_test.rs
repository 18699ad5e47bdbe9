//! End-to-end scheduling scenarios: fusion, reduce grouping, assign ordering,
//! idempotence and AST round-trips.

use fxhash::FxHashSet;
use scheduler::{
    create_schedule, create_schedule_with_vars, BinaryOp, BufferOp, ConstValue, DType, LazyBuffer,
    LoadOp, Op, OpArg, ReduceOp, ScheduleItem,
};
use shape::{dims_of, values_of, Dim, Variable};
use std::rc::Rc;

const DEV: &str = "CPU";

fn tensor(shape: &[usize]) -> LazyBuffer {
    LazyBuffer::loadop(LoadOp::Empty, &dims_of(shape), DType::Float32, DEV, None, &[], false).unwrap()
}

fn realize(outs: &[LazyBuffer]) -> Vec<ScheduleItem> {
    create_schedule(outs, None).unwrap()
}

fn add(a: &LazyBuffer, b: &LazyBuffer) -> LazyBuffer {
    a.e(Op::Binary(BinaryOp::Add), &[b.clone()], None).unwrap()
}

fn add_const(a: &LazyBuffer, v: f64) -> LazyBuffer {
    add(a, &a.const_like(ConstValue::Float(v), None).unwrap())
}

#[test]
fn test_single_elementwise_kernel() {
    let a = tensor(&[2]);
    realize(&[a.clone()]);
    let out = add_const(&a, 2.0);
    let sched = realize(&[out]);
    assert_eq!(sched.len(), 1);
    let item = &sched[0];
    assert_eq!(item.ast[0].op(), Op::Buffer(BufferOp::Store));
    assert_eq!(item.inputs.len(), 1);
    assert!(Rc::ptr_eq(&item.inputs[0], &a.buffer()));
}

#[test]
fn test_schedule_ast_serde_round_trip() {
    let a = tensor(&[2]);
    realize(&[a.clone()]);
    let out = add_const(&a, 2.0);
    let sched = realize(&[out]);
    let json = serde_json::to_string(&sched.last().unwrap().ast).unwrap();
    let back: Vec<scheduler::LazyOp> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, sched.last().unwrap().ast);
}

#[test]
fn test_two_realized_inputs_fuse_into_one_kernel() {
    let x = tensor(&[10, 10]);
    let y = tensor(&[10, 10]);
    realize(&[x.clone(), y.clone()]);
    let z = add_const(&add(&x, &y), 1.0);
    let sched = realize(&[z]);
    assert_eq!(sched.len(), 1);
    let ops = sched[0].ast[0].lazyops();
    let loads = ops.iter().filter(|o| o.op() == Op::Buffer(BufferOp::Load)).count();
    let consts = ops.iter().filter(|o| o.op() == Op::Buffer(BufferOp::Const)).count();
    let adds = ops.iter().filter(|o| o.op() == Op::Binary(BinaryOp::Add)).count();
    assert_eq!((loads, consts, adds), (2, 1, 2));
    assert_eq!(sched[0].inputs.len(), 2);
}

#[test]
fn test_reduce_fuses_with_elementwise_sink() {
    let x = tensor(&[10, 10]);
    realize(&[x.clone()]);
    let s = x.r(ReduceOp::Sum, &[0]).unwrap();
    let out = add_const(&s, 1.0);
    let sched = realize(&[out.clone()]);
    assert_eq!(sched.len(), 1);
    // the reduce and the add share the kernel
    let ops = sched[0].ast[0].lazyops();
    assert!(ops.iter().any(|o| o.op().is_reduce()));
    assert!(ops.iter().any(|o| o.op() == Op::Binary(BinaryOp::Add)));
    // and the kernel's output shape is the reduce's shape
    match sched[0].ast[0].arg() {
        Some(OpArg::Mem(m)) => assert_eq!(values_of(m.st.shape()), vec![1, 10]),
        other => panic!("store arg expected, got {:?}", other),
    }
}

#[test]
fn test_multi_consumer_reduce_realizes_once() {
    let x = tensor(&[10, 10]);
    realize(&[x.clone()]);
    let r = x.r(ReduceOp::Sum, &[0]).unwrap();
    let a = r.e(Op::Binary(BinaryOp::Mul), &[r.const_like(ConstValue::Float(2.0), None).unwrap()], None).unwrap();
    let b = add_const(&r, 3.0);
    let sched = realize(&[a.clone(), b.clone()]);
    assert_eq!(sched.len(), 3);
    // the reduce runs first, and feeds both consumers as an input buffer
    let rbuf = r.buffer();
    assert!(Rc::ptr_eq(&sched[0].outputs[0], &rbuf));
    assert!(sched[1].inputs.iter().any(|i| Rc::ptr_eq(i, &rbuf)));
    assert!(sched[2].inputs.iter().any(|i| Rc::ptr_eq(i, &rbuf)));
}

#[test]
fn test_assign_runs_after_readers_of_old_value() {
    let b = tensor(&[4]);
    realize(&[b.clone()]);
    let c = b.e(Op::Binary(BinaryOp::Mul), &[b.const_like(ConstValue::Float(2.0), None).unwrap()], None).unwrap();
    let assign = b.assign(&add_const(&b, 1.0)).unwrap();
    let sched = create_schedule(&[c.clone(), assign.clone()], None).unwrap();
    assert_eq!(sched.len(), 2);
    // the reader of the pre-assign value is scheduled strictly earlier
    assert!(Rc::ptr_eq(&sched[0].outputs[0], &c.buffer()));
    assert!(Rc::ptr_eq(&sched[1].outputs[0], &b.buffer()));
}

#[test]
fn test_assign_shares_target_buffer_slot() {
    let b = tensor(&[4]);
    realize(&[b.clone()]);
    let assign = b.assign(&add_const(&b, 1.0)).unwrap();
    let sched = realize(&[assign.clone()]);
    assert_eq!(sched.len(), 1);
    // in-place: the kernel's output is the target's own buffer, loaded at
    // index 0, and the target is not an extra input
    assert!(Rc::ptr_eq(&sched[0].outputs[0], &b.buffer()));
    assert!(sched[0].inputs.is_empty());
}

#[test]
fn test_copy_and_empty_items_are_trivial() {
    let x = tensor(&[4]);
    let first = realize(&[x.clone()]);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].ast[0].op(), Op::Load(LoadOp::Empty));
    let moved = x.copy_to_device("EXT", false).unwrap();
    let sched = realize(&[moved]);
    assert_eq!(sched.len(), 1);
    assert_eq!(sched[0].ast[0].op(), Op::Load(LoadOp::Copy));
    assert!(sched[0].ast[0].src().is_empty());
    assert_eq!(sched[0].inputs.len(), 1);
}

#[test]
fn test_reschedule_is_empty() {
    let x = tensor(&[4]);
    let out = add_const(&x, 1.0);
    let mut seen = FxHashSet::default();
    let first = create_schedule(&[out.clone()], Some(&mut seen)).unwrap();
    assert_eq!(first.len(), 2); // the EMPTY source and the add
    let again = create_schedule(&[out], Some(&mut seen)).unwrap();
    assert!(again.is_empty());
}

#[test]
fn test_inputs_are_realized_before_use() {
    let x = tensor(&[8, 8]);
    realize(&[x.clone()]);
    let r = x.r(ReduceOp::Sum, &[1]).unwrap();
    let a = add_const(&r, 1.0);
    let b = r.e(Op::Binary(BinaryOp::Mul), &[r.const_like(ConstValue::Float(3.0), None).unwrap()], None).unwrap();
    let c = add(&a, &b);
    let sched = realize(&[c]);
    let initially_realized = vec![x.buffer()];
    let mut produced: Vec<*const scheduler::Buffer> =
        initially_realized.iter().map(|b| Rc::as_ptr(b)).collect();
    for item in &sched {
        for input in &item.inputs {
            assert!(
                produced.contains(&Rc::as_ptr(input)),
                "input {:?} used before it was realized",
                input
            );
        }
        for output in &item.outputs {
            // no item reads the buffer it is about to produce
            assert!(!item.inputs.iter().any(|i| Rc::ptr_eq(i, output)));
            produced.push(Rc::as_ptr(output));
        }
    }
}

#[test]
fn test_const_expand_reduce_round_trip() {
    // a const reshaped, expanded and fully summed folds to v * prod(shape)
    let c = LazyBuffer::loadop(
        LoadOp::Const,
        &dims_of(&[3, 4]),
        DType::Float32,
        DEV,
        Some(OpArg::Const(ConstValue::Float(2.0))),
        &[],
        false,
    )
    .unwrap();
    let big = c.reshape(&dims_of(&[1, 12])).unwrap().expand(&dims_of(&[5, 12])).unwrap();
    let total = big.r(ReduceOp::Sum, &[0, 1]).unwrap();
    assert!(total.is_unrealized_unmasked_const());
    assert_eq!(total.base().const_arg().unwrap(), ConstValue::Float(120.0));
    // nothing to schedule: a lone const produces no kernels
    assert!(realize(&[total]).is_empty());
}

#[test]
fn test_variable_bindings_are_collected() {
    let n = Variable::new("n", 1, 16);
    let shape = vec![n.clone().bind(8), Dim::Fixed(2)];
    let x = LazyBuffer::loadop(LoadOp::Empty, &shape, DType::Float32, DEV, None, &[], false).unwrap();
    let (first, vals) = create_schedule_with_vars(&[x.clone()], None).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(vals.get(&n), Some(&8));
    let out = add_const(&x, 1.0);
    let (sched, vals) = create_schedule_with_vars(&[out], None).unwrap();
    assert_eq!(sched.len(), 1);
    assert_eq!(vals.get(&n), Some(&8));
    // the embedded tracker is unbound
    let ops = sched[0].ast[0].lazyops();
    let load = ops.iter().find(|o| o.op() == Op::Buffer(BufferOp::Load)).unwrap();
    assert_eq!(load.vars(), vec![n]);
}

#[test]
fn test_forced_realize_cuts_fusion() {
    let x = tensor(&[4, 4]);
    realize(&[x.clone()]);
    let mid = add_const(&x, 1.0);
    let c = mid.contiguous().unwrap();
    assert!(mid.base().forced_realize());
    let out = add_const(&c, 2.0);
    let sched = realize(&[out]);
    assert_eq!(sched.len(), 2);
}

#[test]
fn test_padded_unsafe_op_is_realized() {
    let x = tensor(&[4]);
    let y = tensor(&[4]);
    realize(&[x.clone(), y.clone()]);
    // DIV is unsafe under zero padding, so the pad boundary realizes it
    let d = x.e(Op::Binary(BinaryOp::Div), &[y.clone()], None).unwrap();
    let padded = d.pad(&[(0, 4)]).unwrap();
    let out = add_const(&padded, 1.0);
    let sched = realize(&[out]);
    assert_eq!(sched.len(), 2);

    // a safe producer under the same pad stays fused
    let s = add(&x, &y);
    let padded = s.pad(&[(0, 4)]).unwrap();
    let out = add_const(&padded, 1.0);
    let sched = realize(&[out]);
    assert_eq!(sched.len(), 1);
}
