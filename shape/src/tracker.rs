//! The stacked-view tracker.
//!
//! Movement ops rewrite the top view when possible and stack a fresh
//! contiguous reinterpretation otherwise; composition concatenates stacks;
//! `simplify` drops and merges redundant views. The last view is always the
//! user-facing shape.

use crate::symbolic::{prod_dims, Dim, Variable};
use crate::view::{canonical_strides, View};
use crate::ShapeError;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeTracker {
    pub views: SmallVec<[View; 2]>,
}

impl ShapeTracker {
    pub fn from_shape(shape: Vec<Dim>) -> ShapeTracker {
        ShapeTracker { views: smallvec![View::create(shape, None, 0, None)] }
    }

    pub fn shape(&self) -> &[Dim] {
        &self.views.last().expect("tracker has at least one view").shape
    }

    /// Element count of the user-facing shape.
    pub fn size(&self) -> usize {
        prod_dims(self.shape())
    }

    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].contiguous
    }

    /// True when the top view's mask excludes every element.
    pub fn top_mask_is_empty(&self) -> bool {
        self.views.last().is_some_and(View::mask_is_empty)
    }

    /// Apply `other` on top of `self` and simplify.
    pub fn compose(&self, other: &ShapeTracker) -> ShapeTracker {
        let mut views = self.views.clone();
        views.extend(other.views.iter().cloned());
        ShapeTracker { views }.simplify()
    }

    /// Drop identity views and fold contiguous reshapes into the view below.
    pub fn simplify(&self) -> ShapeTracker {
        let mut views = self.views.clone();
        loop {
            if views.len() < 2 {
                break;
            }
            if views[0].contiguous {
                views.remove(0);
                continue;
            }
            let n = views.len();
            if views[n - 1].contiguous {
                // a contiguous top view is a pure reshape of the view below
                if let Some(merged) = views[n - 2].reshape(&views[n - 1].shape.clone()) {
                    views.truncate(n - 1);
                    *views.last_mut().expect("nonempty") = merged;
                    continue;
                }
            }
            break;
        }
        ShapeTracker { views }
    }

    // *** movement ops ***

    pub fn reshape(&self, new_shape: &[Dim]) -> Result<ShapeTracker, ShapeError> {
        if prod_dims(self.shape()) != prod_dims(new_shape) {
            return Err(ShapeError::ReshapeSizeMismatch {
                from: crate::values_of(self.shape()),
                to: crate::values_of(new_shape),
            });
        }
        let mut views = self.views.clone();
        let last = views.last_mut().expect("nonempty");
        match last.reshape(new_shape) {
            Some(v) => *last = v,
            None => views.push(View::create(new_shape.to_vec(), None, 0, None)),
        }
        Ok(ShapeTracker { views })
    }

    pub fn permute(&self, axes: &[usize]) -> Result<ShapeTracker, ShapeError> {
        let n = self.shape().len();
        let mut seen = vec![false; n];
        if axes.len() != n || axes.iter().any(|&a| a >= n || std::mem::replace(&mut seen[a], true)) {
            return Err(ShapeError::InvalidPermutation(axes.to_vec()));
        }
        Ok(self.replace_top(|v| v.permute(axes)))
    }

    pub fn expand(&self, new_shape: &[Dim]) -> Result<ShapeTracker, ShapeError> {
        let shape = self.shape();
        let ok = new_shape.len() == shape.len()
            && shape
                .iter()
                .zip(new_shape)
                .all(|(a, b)| a.value() == b.value() || a.value() == 1);
        if !ok {
            return Err(ShapeError::ExpandMismatch {
                from: crate::values_of(shape),
                to: crate::values_of(new_shape),
            });
        }
        Ok(self.replace_top(|v| v.expand(new_shape)))
    }

    pub fn shrink(&self, ranges: &[(usize, usize)]) -> Result<ShapeTracker, ShapeError> {
        let shape = self.shape();
        if ranges.len() != shape.len() {
            return Err(ShapeError::AxisCountMismatch { expected: shape.len(), got: ranges.len() });
        }
        for (i, (&(lo, hi), d)) in ranges.iter().zip(shape).enumerate() {
            if lo > hi || hi > d.value() {
                return Err(ShapeError::ShrinkOutOfRange { axis: i, range: (lo, hi), size: d.value() });
            }
        }
        Ok(self.replace_top(|v| v.shrink(ranges)))
    }

    pub fn pad(&self, padding: &[(usize, usize)]) -> Result<ShapeTracker, ShapeError> {
        if padding.len() != self.shape().len() {
            return Err(ShapeError::AxisCountMismatch { expected: self.shape().len(), got: padding.len() });
        }
        Ok(self.replace_top(|v| v.pad(padding)))
    }

    pub fn stride(&self, mul: &[isize]) -> Result<ShapeTracker, ShapeError> {
        if mul.len() != self.shape().len() {
            return Err(ShapeError::AxisCountMismatch { expected: self.shape().len(), got: mul.len() });
        }
        if let Some(i) = mul.iter().position(|&m| m == 0) {
            return Err(ShapeError::ZeroStride(i));
        }
        Ok(self.replace_top(|v| v.stride(mul)))
    }

    fn replace_top(&self, f: impl FnOnce(&View) -> View) -> ShapeTracker {
        let mut views = self.views.clone();
        let last = views.last_mut().expect("nonempty");
        *last = f(last);
        ShapeTracker { views }
    }

    // *** symbolic queries ***

    /// Variables appearing in any view's shape, sorted and deduplicated.
    pub fn vars(&self) -> Vec<Variable> {
        let mut vars: Vec<Variable> = self
            .views
            .iter()
            .flat_map(|v| v.shape.iter().filter_map(|d| d.var().cloned()))
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Current `(variable, value)` bindings, sorted by variable.
    pub fn var_vals(&self) -> Vec<(Variable, usize)> {
        let mut vals: Vec<(Variable, usize)> = self
            .views
            .iter()
            .flat_map(|v| {
                v.shape.iter().filter_map(|d| match d {
                    Dim::Bound(var, val) => Some((var.clone(), *val)),
                    _ => None,
                })
            })
            .collect();
        vals.sort();
        vals.dedup();
        vals
    }

    /// Strip bindings from every dimension, reporting them.
    pub fn unbind(&self) -> (ShapeTracker, Vec<(Variable, usize)>) {
        let mut bindings = Vec::new();
        let views = self
            .views
            .iter()
            .map(|v| {
                let shape = v
                    .shape
                    .iter()
                    .map(|d| {
                        let (d, b) = d.unbind();
                        if let Some(b) = b {
                            if !bindings.contains(&b) {
                                bindings.push(b);
                            }
                        }
                        d
                    })
                    .collect();
                View { shape, ..v.clone() }
            })
            .collect();
        bindings.sort();
        (ShapeTracker { views }, bindings)
    }

    // *** physical queries ***

    /// Per-axis strides of the composed mapping, `None` where the composition
    /// cannot be expressed as a single stride.
    pub fn real_strides(&self) -> Vec<Option<isize>> {
        let st = self.simplify();
        if st.views.len() == 1 {
            st.views[0].strides.iter().map(|&s| Some(s)).collect()
        } else {
            vec![None; self.shape().len()]
        }
    }

    /// Axes the composed mapping walks with stride exactly 1.
    pub fn unit_stride_axes(&self) -> Vec<usize> {
        self.real_strides()
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == Some(1))
            .map(|(i, _)| i)
            .collect()
    }

    /// Upper bound on the number of buffer elements this tracker can touch,
    /// computed from the storage-level view and its mask.
    pub fn real_size(&self) -> usize {
        if self.size() == 0 {
            return 0;
        }
        let v = &self.views[0];
        let mut max_idx = v.offset;
        for (i, (d, &st)) in v.shape.iter().zip(&v.strides).enumerate() {
            let (lo, hi) = v.mask.as_ref().map_or((0, d.value()), |m| m[i]);
            if lo >= hi {
                return 0;
            }
            if st > 0 {
                max_idx += (hi as isize - 1) * st;
            } else {
                max_idx += lo as isize * st;
            }
        }
        (max_idx + 1).max(0) as usize
    }

    /// Invert this tracker over `out_shape`. Conservative: only a single
    /// unmasked zero-offset view that is a permutation of a contiguous layout
    /// inverts; anything else reports `None` and the caller falls back to
    /// forcing a realize.
    pub fn invert(&self, out_shape: &[Dim]) -> Option<ShapeTracker> {
        let st = self.simplify();
        if st.views.len() != 1 {
            return None;
        }
        let v = &st.views[0];
        if v.mask.is_some() || v.offset != 0 || v.shape.len() != out_shape.len() {
            return None;
        }
        if prod_dims(&v.shape) != prod_dims(out_shape) {
            return None;
        }
        let out_canonical = canonical_strides(out_shape);
        let self_canonical = canonical_strides(&v.shape);
        let mut used = vec![false; out_shape.len()];
        let mut inv_strides = vec![0isize; out_shape.len()];
        for i in 0..v.shape.len() {
            let j = (0..out_shape.len()).find(|&j| {
                !used[j]
                    && out_shape[j].value() == v.shape[i].value()
                    && out_canonical[j] == v.strides[i]
            })?;
            used[j] = true;
            inv_strides[j] = self_canonical[i];
        }
        Some(ShapeTracker {
            views: smallvec![View::create(out_shape.to_vec(), Some(inv_strides), 0, None)],
        })
    }
}
