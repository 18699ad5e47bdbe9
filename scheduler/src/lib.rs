//! Lazy tensor scheduler.
//!
//! Turns a user-constructed DAG of lazy tensor nodes into an ordered sequence
//! of fused compute kernels ready for code generation:
//!
//! - [`lazy`]: the LazyBuffer graph with inline algebraic simplification and
//!   a weak-valued structural cache
//! - [`ops`]: the op taxonomy and the immutable [`ops::LazyOp`] AST
//! - [`schedule`]: fusion boundaries, reduce grouping, AST lowering and
//!   assignment-safe topological ordering
//! - [`flops`]: the flop/memory cost interpreter
//!
//! Backend code generation, buffer allocation and device runtime are external
//! collaborators; this crate stops at [`ops::ScheduleItem`].

pub mod buffer;
pub mod config;
pub mod dtype;
pub mod error;
pub mod flops;
pub mod lazy;
pub mod logging;
pub mod ops;
pub mod schedule;

pub use buffer::{Buffer, BufferOptions};
pub use config::Config;
pub use dtype::{as_const, ConstValue, DType, ImageDType};
pub use error::{LazyError, ScheduleError};
pub use flops::{get_lazyop_info, FlopCounter};
pub use lazy::LazyBuffer;
pub use ops::{
    exec_alu, has_alu, is_unsafe_pad_op, BinaryOp, BufferOp, ConstBuffer, LazyOp, LoadOp,
    MemBuffer, Op, OpArg, ReduceOp, ScheduleItem, TernaryOp, UnaryOp,
};
pub use schedule::{create_schedule, create_schedule_with_vars, VarVals};
