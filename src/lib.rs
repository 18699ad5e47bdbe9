//! Facade over the kiln workspace: the shape algebra and the lazy tensor
//! scheduler, re-exported under one roof.

pub use scheduler;
pub use shape;

pub use scheduler::{
    create_schedule, create_schedule_with_vars, get_lazyop_info, Buffer, ConstValue, DType,
    LazyBuffer, LazyError, LazyOp, ScheduleError, ScheduleItem,
};
pub use shape::{Dim, ShapeTracker, Variable};
