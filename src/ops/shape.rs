//! Shape manipulating builders: slicing, subsampling, squeezing, reshaping,
//! transposing and gathering.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use super::{aliasing_op, single_output_op};
use crate::core::{DType, GraphError, GraphResult, OpKind, Tensor, TensorInfo};

/// A `start:stop:step` range along one axis. Missing bounds default to the
/// full axis in the direction of the step; negative bounds count from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SliceRange {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceRange {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// The whole axis.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Resolve against an axis of size `dim` with a step of `+1` or `-1`.
    /// Returns `(start, end, len)` where `end` is exclusive.
    pub(crate) fn resolve(&self, dim: usize, step: i64) -> (i64, i64, usize) {
        let d = dim as i64;
        let wrap = |v: i64| if v < 0 { v + d } else { v };
        if step > 0 {
            let start = self.start.map_or(0, wrap).clamp(0, d);
            let end = self.stop.map_or(d, wrap).clamp(0, d);
            (start, end, (end - start).max(0) as usize)
        } else {
            let start = self.start.map_or(d - 1, wrap).clamp(-1, d - 1);
            let end = self.stop.map_or(-1, wrap).clamp(-1, d - 1);
            (start, end, (start - end).max(0) as usize)
        }
    }
}

macro_rules! impl_slice_range_from {
    ($($t:ty),*) => {$(
        impl From<Range<$t>> for SliceRange {
            fn from(r: Range<$t>) -> Self {
                SliceRange::new(Some(r.start as i64), Some(r.end as i64), None)
            }
        }

        impl From<RangeFrom<$t>> for SliceRange {
            fn from(r: RangeFrom<$t>) -> Self {
                SliceRange::new(Some(r.start as i64), None, None)
            }
        }

        impl From<RangeTo<$t>> for SliceRange {
            fn from(r: RangeTo<$t>) -> Self {
                SliceRange::new(None, Some(r.end as i64), None)
            }
        }
    )*};
}

impl_slice_range_from!(i32, i64);

impl From<RangeFull> for SliceRange {
    fn from(_: RangeFull) -> Self {
        SliceRange::full()
    }
}

fn check_axis(op: &'static str, axis: usize, rank: usize) -> GraphResult<()> {
    if axis >= rank {
        return Err(GraphError::InvalidAttribute {
            op,
            reason: format!("axis {} is out of range for rank {}", axis, rank),
        });
    }
    Ok(())
}

/// Slice `t` along `axes`. Steps must be `1` or `-1`; use [`subsample`] for
/// larger strides. Axes not listed keep their full extent.
#[track_caller]
pub fn slice(t: &Tensor, axes: &[usize], ranges: &[SliceRange]) -> GraphResult<Tensor> {
    if axes.len() != ranges.len() {
        return Err(GraphError::InvalidAttribute {
            op: "slice",
            reason: format!("{} axes but {} ranges", axes.len(), ranges.len()),
        });
    }
    let shape = t.shape();
    let rank = shape.len();
    let mut starts: Vec<i64> = vec![0; rank];
    let mut ends: Vec<i64> = shape.iter().map(|d| *d as i64).collect();
    let mut steps: Vec<i64> = vec![1; rank];
    let mut out_shape = shape.clone();
    for (&axis, range) in axes.iter().zip(ranges) {
        check_axis("slice", axis, rank)?;
        let step = range.step.unwrap_or(1);
        if step != 1 && step != -1 {
            return Err(GraphError::InvalidAttribute {
                op: "slice",
                reason: format!("step {} on axis {}; only 1 and -1 are supported", step, axis),
            });
        }
        let (start, end, len) = range.resolve(shape[axis], step);
        starts[axis] = start;
        ends[axis] = end;
        steps[axis] = step;
        out_shape[axis] = len;
    }
    single_output_op(
        "slice",
        OpKind::Slice { starts, ends, steps },
        &[t],
        TensorInfo::new(t.dtype(), out_shape),
    )
}

/// Keep every `strides[i]`-th element along axis `i`.
#[track_caller]
pub fn subsample(t: &Tensor, strides: &[usize]) -> GraphResult<Tensor> {
    let shape = t.shape();
    if strides.len() != shape.len() || strides.contains(&0) {
        return Err(GraphError::InvalidAttribute {
            op: "subsample",
            reason: format!("strides {:?} do not fit shape {:?}", strides, shape),
        });
    }
    let out_shape = shape
        .iter()
        .zip(strides)
        .map(|(d, s)| d.div_ceil(*s))
        .collect();
    single_output_op(
        "subsample",
        OpKind::Subsample { strides: strides.to_vec() },
        &[t],
        TensorInfo::new(t.dtype(), out_shape),
    )
}

/// Remove size-1 `axes`.
#[track_caller]
pub fn squeeze(t: &Tensor, axes: &[usize]) -> GraphResult<Tensor> {
    let shape = t.shape();
    for &axis in axes {
        check_axis("squeeze", axis, shape.len())?;
        if shape[axis] != 1 {
            return Err(GraphError::ShapeMismatch {
                op: "squeeze",
                reason: format!("axis {} of {:?} has size {}", axis, shape, shape[axis]),
            });
        }
    }
    let out_shape = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| !axes.contains(i))
        .map(|(_, d)| *d)
        .collect();
    single_output_op(
        "squeeze",
        OpKind::Squeeze { axes: axes.to_vec() },
        &[t],
        TensorInfo::new(t.dtype(), out_shape),
    )
}

fn reshape_kind(t: &Tensor, shape: &[i64]) -> GraphResult<(OpKind, TensorInfo)> {
    let nelms = t.nelms();
    let bad = |reason: String| GraphError::ShapeMismatch { op: "reshape", reason };
    if shape.iter().filter(|d| **d == -1).count() > 1 || shape.iter().any(|d| *d < -1) {
        return Err(bad(format!("invalid target shape {:?}", shape)));
    }
    let known: usize = shape.iter().filter(|d| **d >= 0).map(|d| *d as usize).product();
    let out_shape: Vec<usize> = shape
        .iter()
        .map(|d| {
            if *d == -1 {
                if known == 0 {
                    0
                } else {
                    nelms / known
                }
            } else {
                *d as usize
            }
        })
        .collect();
    if out_shape.iter().product::<usize>() != nelms {
        return Err(bad(format!("cannot reshape {:?} to {:?}", t.shape(), shape)));
    }
    Ok((
        OpKind::Reshape { shape: out_shape.clone() },
        TensorInfo::new(t.dtype(), out_shape),
    ))
}

/// Reshape to `shape`; at most one entry may be `-1` and is inferred.
#[track_caller]
pub fn reshape(t: &Tensor, shape: &[i64]) -> GraphResult<Tensor> {
    let (kind, info) = reshape_kind(t, shape)?;
    single_output_op("reshape", kind, &[t], info)
}

/// Reshape `t` in place; the output is a view aliasing `t`.
#[track_caller]
pub fn reshape_(t: &Tensor, shape: &[i64]) -> GraphResult<Tensor> {
    let (kind, info) = reshape_kind(t, shape)?;
    aliasing_op("reshape_inplace", kind, &[t], info)
}

/// Reshape to one dimension.
#[track_caller]
pub fn flatten(t: &Tensor) -> GraphResult<Tensor> {
    reshape(t, &[-1])
}

#[track_caller]
pub fn flatten_(t: &Tensor) -> GraphResult<Tensor> {
    reshape_(t, &[-1])
}

fn transpose_kind(t: &Tensor, permutation: Option<&[usize]>) -> GraphResult<(OpKind, TensorInfo)> {
    let shape = t.shape();
    let permutation: Vec<usize> = match permutation {
        Some(p) => p.to_vec(),
        None => (0..shape.len()).rev().collect(),
    };
    let mut sorted = permutation.clone();
    sorted.sort_unstable();
    if sorted != (0..shape.len()).collect::<Vec<_>>() {
        return Err(GraphError::InvalidAttribute {
            op: "transpose",
            reason: format!("{:?} is not a permutation of rank {}", permutation, shape.len()),
        });
    }
    let out_shape = permutation.iter().map(|&p| shape[p]).collect();
    Ok((
        OpKind::Transpose { permutation },
        TensorInfo::new(t.dtype(), out_shape),
    ))
}

/// Permute axes; `None` reverses them.
#[track_caller]
pub fn transpose(t: &Tensor, permutation: Option<&[usize]>) -> GraphResult<Tensor> {
    let (kind, info) = transpose_kind(t, permutation)?;
    single_output_op("transpose", kind, &[t], info)
}

/// Permute the axes of `t` in place; the output is a view aliasing `t`.
#[track_caller]
pub fn transpose_(t: &Tensor, permutation: Option<&[usize]>) -> GraphResult<Tensor> {
    let (kind, info) = transpose_kind(t, permutation)?;
    aliasing_op("transpose_inplace", kind, &[t], info)
}

/// Select entries of `t` along `axis` with the integer tensor `indices`.
#[track_caller]
pub fn gather(t: &Tensor, indices: &Tensor, axis: usize) -> GraphResult<Tensor> {
    let shape = t.shape();
    check_axis("gather", axis, shape.len())?;
    if !indices.dtype().is_int() {
        return Err(GraphError::DTypeMismatch {
            op: "gather",
            expected: DType::Int32.name(),
            found: indices.dtype().name(),
        });
    }
    let mut out_shape = shape[..axis].to_vec();
    out_shape.extend(indices.shape());
    out_shape.extend_from_slice(&shape[axis + 1..]);
    single_output_op(
        "gather",
        OpKind::Gather { axis },
        &[t, indices],
        TensorInfo::new(t.dtype(), out_shape),
    )
}
