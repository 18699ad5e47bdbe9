//! Backing-storage descriptors.
//!
//! A [`Buffer`] describes the storage slot a base node owns; allocation and
//! data movement belong to the runtime, so here allocation is just a flag the
//! runtime flips. Views never own buffers, and an assign node shares its
//! target's slot.

use crate::dtype::{DType, ImageDType};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Allocator hints attached to a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOptions {
    pub image: Option<ImageDType>,
}

pub struct Buffer {
    device: String,
    size: usize,
    dtype: RefCell<DType>,
    options: RefCell<Option<BufferOptions>>,
    allocated: Cell<bool>,
}

impl Buffer {
    pub fn new(device: &str, size: usize, dtype: DType) -> Rc<Buffer> {
        let options = match &dtype {
            DType::Image(im) => Some(BufferOptions { image: Some(im.clone()) }),
            _ => None,
        };
        Rc::new(Buffer {
            device: device.to_string(),
            size,
            dtype: RefCell::new(dtype),
            options: RefCell::new(options),
            allocated: Cell::new(false),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dtype(&self) -> DType {
        self.dtype.borrow().clone()
    }

    pub fn options(&self) -> Option<BufferOptions> {
        self.options.borrow().clone()
    }

    pub fn nbytes(&self) -> usize {
        self.size * self.dtype.borrow().itemsize()
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated.get()
    }

    /// Mark the storage as materialized. The runtime calls this once it has
    /// backed the descriptor with real memory.
    pub fn allocate(&self) {
        self.allocated.set(true);
    }

    /// Rewrite the dtype and drop allocator hints. Only legal before the
    /// runtime has materialized the storage (image dtype fallback).
    pub(crate) fn force_dtype(&self, dtype: DType) {
        assert!(!self.allocated.get(), "can't fixup allocated buffer");
        *self.dtype.borrow_mut() = dtype;
        *self.options.borrow_mut() = None;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<buf {} size:{} dtype:{}{}>",
            self.device,
            self.size,
            self.dtype.borrow(),
            if self.allocated.get() { " allocated" } else { "" }
        )
    }
}
