// This module implements Tensor::index. The key type decides the algorithm. Integers, ranges
// and tuples of both are basic slicing: each entry becomes a per-axis range, integer entries
// (negative values count from the end) select one element and their axes are squeezed out
// afterwards, and a step whose magnitude exceeds one is realised as a +1/-1 slice followed by
// a subsample. An integer tensor or host array gathers along axis 0. A bool tensor or host
// array selects with `where(mask, t, 0)`, broadcasting the mask, so the result keeps the
// broadcast shape with zeros where the mask is false. Bools, strings and floats are rejected.

//! Tensor indexing.

use std::fmt;
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use super::shape::SliceRange;
use super::{elementwise, ensure_tensor, shape};
use crate::builder;
use crate::core::{DType, GraphError, GraphResult, HostArray, Tensor};

/// A key accepted by [`Tensor::index`].
#[derive(Clone, Debug)]
pub enum IndexKey {
    Int(i64),
    Slice(SliceRange),
    Tuple(Vec<IndexKey>),
    Tensor(Tensor),
    Host(HostArray),
    Bool(bool),
    Str(String),
    Float(f64),
}

impl IndexKey {
    fn kind(&self) -> &'static str {
        match self {
            IndexKey::Int(_) => "int",
            IndexKey::Slice(_) => "slice",
            IndexKey::Tuple(_) => "tuple",
            IndexKey::Tensor(_) => "tensor",
            IndexKey::Host(_) => "host array",
            IndexKey::Bool(_) => "bool",
            IndexKey::Str(_) => "str",
            IndexKey::Float(_) => "float",
        }
    }

    fn invalid(&self) -> GraphError {
        GraphError::InvalidIndexKey {
            kind: self.kind(),
            value: self.to_string(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Slice(r) => {
                let part = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{}:{}:{}", part(r.start), part(r.stop), part(r.step))
            }
            IndexKey::Tuple(keys) => {
                write!(f, "(")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, ")")
            }
            IndexKey::Tensor(t) => write!(f, "{}", t),
            IndexKey::Host(a) => write!(f, "HostArray[{:?} {:?}]", a.host_type(), a.shape()),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Str(s) => write!(f, "'{}'", s),
            IndexKey::Float(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_int_key {
    ($($t:ty),*) => {$(
        impl From<$t> for IndexKey {
            fn from(i: $t) -> Self {
                IndexKey::Int(i as i64)
            }
        }
    )*};
}

impl_int_key!(i32, i64, usize);

macro_rules! impl_range_key {
    ($($r:ty),*) => {$(
        impl From<$r> for IndexKey {
            fn from(r: $r) -> Self {
                IndexKey::Slice(r.into())
            }
        }
    )*};
}

impl_range_key!(
    Range<i32>,
    Range<i64>,
    RangeFrom<i32>,
    RangeFrom<i64>,
    RangeTo<i32>,
    RangeTo<i64>,
    RangeFull,
    SliceRange
);

impl From<Tensor> for IndexKey {
    fn from(t: Tensor) -> Self {
        IndexKey::Tensor(t)
    }
}

impl From<&Tensor> for IndexKey {
    fn from(t: &Tensor) -> Self {
        IndexKey::Tensor(t.clone())
    }
}

impl From<HostArray> for IndexKey {
    fn from(a: HostArray) -> Self {
        IndexKey::Host(a)
    }
}

impl From<bool> for IndexKey {
    fn from(b: bool) -> Self {
        IndexKey::Bool(b)
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        IndexKey::Str(s.to_string())
    }
}

impl From<f64> for IndexKey {
    fn from(v: f64) -> Self {
        IndexKey::Float(v)
    }
}

impl From<Vec<IndexKey>> for IndexKey {
    fn from(keys: Vec<IndexKey>) -> Self {
        IndexKey::Tuple(keys)
    }
}

impl<A: Into<IndexKey>, B: Into<IndexKey>> From<(A, B)> for IndexKey {
    fn from((a, b): (A, B)) -> Self {
        IndexKey::Tuple(vec![a.into(), b.into()])
    }
}

impl<A: Into<IndexKey>, B: Into<IndexKey>, C: Into<IndexKey>> From<(A, B, C)> for IndexKey {
    fn from((a, b, c): (A, B, C)) -> Self {
        IndexKey::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

impl Tensor {
    /// Index this tensor, inserting the ops that realise `key` into the current graph.
    #[track_caller]
    pub fn index(&self, key: impl Into<IndexKey>) -> GraphResult<Tensor> {
        let key = key.into();
        match key {
            IndexKey::Int(_) | IndexKey::Slice(_) => basic_index(self, vec![key]),
            IndexKey::Tuple(keys) => {
                if let Some(bad) = keys
                    .iter()
                    .find(|k| !matches!(k, IndexKey::Int(_) | IndexKey::Slice(_)))
                {
                    return Err(bad.invalid());
                }
                basic_index(self, keys)
            }
            IndexKey::Tensor(ref t) => tensor_index(self, t, &key),
            IndexKey::Host(ref a) => {
                let t = builder::constant(a.clone(), None, None)?.into_tensor();
                tensor_index(self, &t, &key)
            }
            IndexKey::Bool(_) | IndexKey::Str(_) | IndexKey::Float(_) => Err(key.invalid()),
        }
    }
}

#[track_caller]
fn tensor_index(t: &Tensor, index: &Tensor, key: &IndexKey) -> GraphResult<Tensor> {
    let dtype = index.dtype();
    if dtype.is_int() {
        shape::gather(t, index, 0)
    } else if dtype == DType::Bool {
        let zero = ensure_tensor(0i32, t.dtype())?;
        elementwise::where_(index, t, &zero)
    } else {
        Err(key.invalid())
    }
}

#[track_caller]
fn basic_index(t: &Tensor, keys: Vec<IndexKey>) -> GraphResult<Tensor> {
    let shape = t.shape();
    if keys.len() > shape.len() {
        return Err(GraphError::ShapeMismatch {
            op: "index",
            reason: format!("{} indices for a tensor of rank {}", keys.len(), shape.len()),
        });
    }

    let mut axes = Vec::with_capacity(keys.len());
    let mut ranges = Vec::with_capacity(keys.len());
    let mut strides = vec![1usize; shape.len()];
    let mut squeeze_axes = Vec::new();

    for (axis, key) in keys.iter().enumerate() {
        match key {
            IndexKey::Int(i) => {
                let dim = shape[axis] as i64;
                let idx = if *i < 0 { i + dim } else { *i };
                if idx < 0 || idx >= dim {
                    return Err(GraphError::IndexOutOfRange {
                        axis,
                        index: *i,
                        size: shape[axis],
                    });
                }
                axes.push(axis);
                ranges.push(SliceRange::new(Some(idx), Some(idx + 1), None));
                squeeze_axes.push(axis);
            }
            IndexKey::Slice(range) => {
                let step = range.step.unwrap_or(1);
                if step == 0 {
                    return Err(GraphError::InvalidAttribute {
                        op: "index",
                        reason: "slice step cannot be zero".to_string(),
                    });
                }
                axes.push(axis);
                ranges.push(SliceRange::new(range.start, range.stop, Some(step.signum())));
                strides[axis] = step.unsigned_abs() as usize;
            }
            _ => return Err(key.invalid()),
        }
    }

    let mut out = shape::slice(t, &axes, &ranges)?;
    if strides.iter().any(|s| *s > 1) {
        out = shape::subsample(&out, &strides)?;
    }
    if !squeeze_axes.is_empty() {
        out = shape::squeeze(&out, &squeeze_axes)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::graph_input;
    use crate::context::reset_context;
    use crate::core::{Ir, OpKind};

    #[test]
    fn test_key_display() {
        let key: IndexKey = (1i64..3, 2).into();
        assert_eq!(key.to_string(), "(1:3:, 2)");
        assert_eq!(IndexKey::from(SliceRange::full().step(-1)).to_string(), "::-1");
    }

    #[test]
    fn test_int_and_slice() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[4, 5], DType::Float32, "x").unwrap();
        assert_eq!(x.index((1i64..3, 2)).unwrap().shape(), vec![2]);
        assert_eq!(x.index(-1).unwrap().shape(), vec![5]);
        assert_eq!(x.index(..).unwrap().shape(), vec![4, 5]);
        assert!(matches!(
            x.index(4),
            Err(GraphError::IndexOutOfRange { axis: 0, index: 4, size: 4 })
        ));
    }

    #[test]
    fn test_large_step_subsamples() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[5], DType::Float32, "x").unwrap();
        let y = x.index(SliceRange::full().step(-2)).unwrap();
        assert_eq!(y.shape(), vec![3]);
        let kinds: Vec<OpKind> = ir.main_graph().ops().iter().map(|o| o.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::Slice {
                    starts: vec![4],
                    ends: vec![-1],
                    steps: vec![-1]
                },
                OpKind::Subsample { strides: vec![2] },
            ]
        );
    }

    #[test]
    fn test_invalid_keys() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[4], DType::Float32, "x").unwrap();
        for key in [IndexKey::from("a"), IndexKey::from(true), IndexKey::from(1.1)] {
            assert!(matches!(x.index(key), Err(GraphError::InvalidIndexKey { .. })));
        }
        let f = graph_input(&[2], DType::Float32, "f").unwrap();
        assert!(matches!(
            x.index(&f),
            Err(GraphError::InvalidIndexKey { kind: "tensor", .. })
        ));
        assert!(ir.main_graph().ops().is_empty());
    }
}
