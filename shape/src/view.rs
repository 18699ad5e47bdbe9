//! A single strided view over a flat buffer.
//!
//! A view carries a shape, per-axis strides, a base offset and an optional
//! validity mask (per-axis `[lo, hi)` ranges; indices outside the mask read as
//! padding). Movement operations either rewrite the view or, for reshape,
//! report that a single view cannot express the result.

use crate::symbolic::{prod_dims, Dim};
use serde::{Deserialize, Serialize};

/// Row-major strides for a shape, with size-1 axes canonicalized to stride 0.
pub fn canonical_strides(shape: &[Dim]) -> Vec<isize> {
    let mut strides = vec![1isize; shape.len()];
    let mut acc = 1isize;
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        acc *= shape[i].value() as isize;
    }
    for (st, d) in strides.iter_mut().zip(shape) {
        if d.value() == 1 {
            *st = 0;
        }
    }
    strides
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    pub shape: Vec<Dim>,
    pub strides: Vec<isize>,
    pub offset: isize,
    /// Per-axis valid `[lo, hi)` ranges; `None` means fully valid.
    pub mask: Option<Vec<(usize, usize)>>,
    pub contiguous: bool,
}

impl View {
    /// Normalizing constructor: size-1 axes get stride 0, an all-covering mask
    /// is dropped, and contiguity is recomputed.
    pub fn create(
        shape: Vec<Dim>,
        strides: Option<Vec<isize>>,
        offset: isize,
        mask: Option<Vec<(usize, usize)>>,
    ) -> View {
        let canonical = canonical_strides(&shape);
        let mut strides = strides.unwrap_or_else(|| canonical.clone());
        debug_assert_eq!(strides.len(), shape.len());
        for (st, d) in strides.iter_mut().zip(&shape) {
            if d.value() == 1 {
                *st = 0;
            }
        }
        let mask = mask.filter(|m| {
            m.iter()
                .zip(&shape)
                .any(|(&(lo, hi), d)| (lo, hi) != (0, d.value()))
        });
        let contiguous = offset == 0 && mask.is_none() && strides == canonical;
        View { shape, strides, offset, mask, contiguous }
    }

    pub fn size(&self) -> usize {
        prod_dims(&self.shape)
    }

    /// True when the mask is zero-width on every axis.
    pub fn mask_is_empty(&self) -> bool {
        self.mask
            .as_ref()
            .is_some_and(|m| m.iter().all(|&(lo, hi)| hi <= lo))
    }

    pub fn permute(&self, axes: &[usize]) -> View {
        let shape = axes.iter().map(|&i| self.shape[i].clone()).collect();
        let strides = axes.iter().map(|&i| self.strides[i]).collect();
        let mask = self
            .mask
            .as_ref()
            .map(|m| axes.iter().map(|&i| m[i]).collect());
        View::create(shape, Some(strides), self.offset, mask)
    }

    /// Grow size-1 axes; the caller has validated axis compatibility.
    pub fn expand(&self, new_shape: &[Dim]) -> View {
        let mut strides = self.strides.clone();
        let mut mask = self.mask.clone();
        for i in 0..self.shape.len() {
            if self.shape[i].value() != new_shape[i].value() {
                strides[i] = 0;
                if let Some(m) = &mut mask {
                    m[i] = if m[i] == (0, 1) { (0, new_shape[i].value()) } else { (0, 0) };
                }
            }
        }
        View::create(new_shape.to_vec(), Some(strides), self.offset, mask)
    }

    pub fn shrink(&self, ranges: &[(usize, usize)]) -> View {
        let offset = self.offset
            + ranges
                .iter()
                .zip(&self.strides)
                .map(|(&(lo, _), &st)| lo as isize * st)
                .sum::<isize>();
        let shape: Vec<Dim> = ranges
            .iter()
            .zip(&self.shape)
            .map(|(&(lo, hi), d)| if (lo, hi) == (0, d.value()) { d.clone() } else { Dim::Fixed(hi - lo) })
            .collect();
        let mask = self.mask.as_ref().map(|m| {
            m.iter()
                .zip(ranges)
                .map(|(&(ml, mh), &(lo, hi))| {
                    if mh <= lo || ml >= hi {
                        (0, 0)
                    } else {
                        (ml.max(lo) - lo, mh.min(hi) - lo)
                    }
                })
                .collect()
        });
        View::create(shape, Some(self.strides.clone()), offset, mask)
    }

    pub fn pad(&self, padding: &[(usize, usize)]) -> View {
        if padding.iter().all(|&(lo, hi)| lo == 0 && hi == 0) {
            return self.clone();
        }
        let offset = self.offset
            - padding
                .iter()
                .zip(&self.strides)
                .map(|(&(lo, _), &st)| lo as isize * st)
                .sum::<isize>();
        let shape: Vec<Dim> = padding
            .iter()
            .zip(&self.shape)
            .map(|(&(lo, hi), d)| if lo == 0 && hi == 0 { d.clone() } else { Dim::Fixed(d.value() + lo + hi) })
            .collect();
        let mask: Vec<(usize, usize)> = padding
            .iter()
            .zip(self.shape.iter().enumerate())
            .map(|(&(lo, _), (i, d))| {
                let (ml, mh) = self.mask.as_ref().map_or((0, d.value()), |m| m[i]);
                (lo + ml, lo + mh)
            })
            .collect();
        View::create(shape, Some(self.strides.clone()), offset, Some(mask))
    }

    /// Step (|m| > 1) and/or flip (m < 0) each axis.
    pub fn stride(&self, mul: &[isize]) -> View {
        let mut shape = Vec::with_capacity(self.shape.len());
        let mut strides = Vec::with_capacity(self.shape.len());
        let mut offset = self.offset;
        let mut mask = self.mask.clone();
        for i in 0..self.shape.len() {
            let m = mul[i];
            let a = m.unsigned_abs();
            let s = self.shape[i].value();
            shape.push(if a == 1 { self.shape[i].clone() } else { Dim::Fixed(s.div_ceil(a)) });
            strides.push(self.strides[i] * m);
            if m < 0 {
                offset += (s as isize - 1) * self.strides[i];
            }
            if let Some(msk) = &mut mask {
                let (lo, hi) = msk[i];
                msk[i] = if lo >= hi {
                    (0, 0)
                } else if m > 0 {
                    (lo.div_ceil(a), (hi - 1) / a + 1)
                } else {
                    ((s - hi).div_ceil(a), (s - 1 - lo) / a + 1)
                };
            }
        }
        View::create(shape, Some(strides), offset, mask)
    }

    /// Attempt to express a reshape within this single view. Returns `None`
    /// when the caller must stack a fresh view instead. Element counts are
    /// validated by the tracker.
    pub fn reshape(&self, new_shape: &[Dim]) -> Option<View> {
        if self.shape == new_shape {
            return Some(self.clone());
        }
        if self.contiguous {
            return Some(View::create(new_shape.to_vec(), None, 0, None));
        }
        if let Some(v) = self.reshape_ones(new_shape) {
            return Some(v);
        }
        if self.mask.is_some() {
            return None;
        }

        // merge the non-1 axes into maximal contiguous runs, then factor the
        // new shape out of those runs left to right
        let mut runs: Vec<(usize, isize)> = Vec::new();
        for (d, &st) in self.shape.iter().zip(&self.strides) {
            let s = d.value();
            if s == 1 {
                continue;
            }
            if s == 0 {
                return None;
            }
            match runs.last_mut() {
                Some((rs, runit)) if *runit == st * s as isize => {
                    *rs *= s;
                    *runit = st;
                }
                _ => runs.push((s, st)),
            }
        }

        let mut out_strides = Vec::with_capacity(new_shape.len());
        let mut it = runs.into_iter();
        let mut cur = it.next();
        for d in new_shape {
            let v = d.value();
            if v == 1 {
                out_strides.push(0);
                continue;
            }
            let (rem, unit) = cur?;
            if rem % v != 0 {
                return None;
            }
            let rem = rem / v;
            out_strides.push(unit * rem as isize);
            cur = if rem == 1 { it.next() } else { Some((rem, unit)) };
        }
        if cur.is_some() {
            return None;
        }
        Some(View::create(new_shape.to_vec(), Some(out_strides), self.offset, None))
    }

    // reshape that only inserts or removes size-1 axes, mask included
    fn reshape_ones(&self, new_shape: &[Dim]) -> Option<View> {
        let old_nz: Vec<usize> = (0..self.shape.len()).filter(|&i| self.shape[i].value() != 1).collect();
        let new_nz: Vec<usize> = (0..new_shape.len()).filter(|&i| new_shape[i].value() != 1).collect();
        if old_nz.len() != new_nz.len() {
            return None;
        }
        for (&o, &n) in old_nz.iter().zip(&new_nz) {
            if self.shape[o].value() != new_shape[n].value() {
                return None;
            }
        }
        // a dropped size-1 axis with a partial mask cannot pass through
        if let Some(m) = &self.mask {
            for i in 0..self.shape.len() {
                if self.shape[i].value() == 1 && m[i] != (0, 1) {
                    return None;
                }
            }
        }
        let mut strides = vec![0isize; new_shape.len()];
        let mut mask = self.mask.as_ref().map(|_| vec![(0usize, 1usize); new_shape.len()]);
        for (&o, &n) in old_nz.iter().zip(&new_nz) {
            strides[n] = self.strides[o];
            if let (Some(nm), Some(om)) = (&mut mask, &self.mask) {
                nm[n] = om[o];
            }
        }
        Some(View::create(new_shape.to_vec(), Some(strides), self.offset, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::dims_of;

    fn v(shape: &[usize]) -> View {
        View::create(dims_of(shape), None, 0, None)
    }

    #[test]
    fn test_canonical_strides_zero_size_one() {
        assert_eq!(canonical_strides(&dims_of(&[2, 1, 3])), vec![3, 0, 1]);
        assert_eq!(canonical_strides(&dims_of(&[4])), vec![1]);
        assert_eq!(canonical_strides(&dims_of(&[])), Vec::<isize>::new());
    }

    #[test]
    fn test_contiguous_flag() {
        assert!(v(&[2, 3]).contiguous);
        assert!(!v(&[2, 3]).permute(&[1, 0]).contiguous);
        assert!(v(&[2, 3]).permute(&[0, 1]).contiguous);
    }

    #[test]
    fn test_reshape_merge_and_split() {
        // merge (2,3) -> (6,)
        let m = v(&[2, 3]).reshape(&dims_of(&[6])).unwrap();
        assert_eq!(m.strides, vec![1]);
        // split a non-contiguous axis: (2, 6) with row stride 12
        let wide = View::create(dims_of(&[2, 6]), Some(vec![12, 1]), 0, None);
        let s = wide.reshape(&dims_of(&[2, 2, 3])).unwrap();
        assert_eq!(s.strides, vec![12, 3, 1]);
        // a permuted view cannot merge
        assert!(v(&[2, 3]).permute(&[1, 0]).reshape(&dims_of(&[6])).is_none());
    }

    #[test]
    fn test_reshape_ones_with_mask() {
        let padded = v(&[4]).pad(&[(2, 0)]);
        assert_eq!(padded.mask, Some(vec![(2, 6)]));
        let lifted = padded.reshape(&dims_of(&[1, 6])).unwrap();
        assert_eq!(lifted.mask, Some(vec![(0, 1), (2, 6)]));
        assert_eq!(lifted.strides, vec![0, 1]);
    }

    #[test]
    fn test_pad_then_shrink_mask() {
        let p = v(&[4]).pad(&[(1, 2)]);
        assert_eq!(p.shape, dims_of(&[7]));
        assert_eq!(p.mask, Some(vec![(1, 5)]));
        assert_eq!(p.offset, -1);
        let s = p.shrink(&[(0, 3)]);
        assert_eq!(s.mask, Some(vec![(1, 3)]));
        let empty = p.shrink(&[(5, 7)]);
        assert!(empty.mask_is_empty());
    }

    #[test]
    fn test_expand_masked_unit_axis() {
        let m = v(&[4]).pad(&[(1, 0)]).reshape(&dims_of(&[1, 5])).unwrap();
        let e = m.expand(&dims_of(&[3, 5]));
        assert_eq!(e.mask, Some(vec![(0, 3), (1, 5)]));
        assert_eq!(e.strides, vec![0, 1]);
    }

    #[test]
    fn test_stride_flip() {
        let f = v(&[5]).stride(&[-1]);
        assert_eq!(f.offset, 4);
        assert_eq!(f.strides, vec![-1]);
        assert_eq!(f.shape, dims_of(&[5]));
        // flip of a padded view keeps the mask aligned
        let p = v(&[3]).pad(&[(2, 0)]).stride(&[-1]);
        assert_eq!(p.mask, Some(vec![(0, 3)]));
    }

    #[test]
    fn test_stride_step() {
        let s = v(&[10]).stride(&[3]);
        assert_eq!(s.shape, dims_of(&[4]));
        assert_eq!(s.strides, vec![3]);
    }
}
