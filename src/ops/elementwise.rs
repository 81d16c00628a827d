//! Elementwise, logical and matrix-multiply builders.
//!
//! Binary builders require matching dtypes and broadcast their operand
//! shapes numpy-style. Logical builders cast non-bool operands to bool first.
//! Builders ending in `_` write their result into the first operand and return
//! it; the broadcast result must then keep that operand's shape.

use super::{broadcast_shapes, inplace_op, single_output_op};
use crate::core::{DType, GraphError, GraphResult, OpKind, Tensor, TensorInfo};

fn check_same_dtype(op: &'static str, lhs: &Tensor, rhs: &Tensor) -> GraphResult<DType> {
    let (l, r) = (lhs.dtype(), rhs.dtype());
    if l != r {
        return Err(GraphError::DTypeMismatch {
            op,
            expected: l.name(),
            found: r.name(),
        });
    }
    Ok(l)
}

#[track_caller]
fn binary(name: &'static str, kind: OpKind, lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    let dtype = check_same_dtype(name, lhs, rhs)?;
    let shape = broadcast_shapes(name, &lhs.shape(), &rhs.shape())?;
    single_output_op(name, kind, &[lhs, rhs], TensorInfo::new(dtype, shape))
}

#[track_caller]
fn binary_inplace(
    name: &'static str,
    kind: OpKind,
    lhs: &Tensor,
    rhs: &Tensor,
) -> GraphResult<Tensor> {
    let dtype = check_same_dtype(name, lhs, rhs)?;
    let shape = broadcast_shapes(name, &lhs.shape(), &rhs.shape())?;
    inplace_op(name, kind, &[lhs, rhs], TensorInfo::new(dtype, shape))
}

#[track_caller]
fn unary(name: &'static str, kind: OpKind, t: &Tensor) -> GraphResult<Tensor> {
    single_output_op(name, kind, &[t], t.info())
}

#[track_caller]
fn as_bool(t: &Tensor) -> GraphResult<Tensor> {
    if t.dtype() == DType::Bool {
        Ok(t.clone())
    } else {
        cast(t, DType::Bool)
    }
}

#[track_caller]
pub fn add(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary("add", OpKind::Add, lhs, rhs)
}

/// Add `rhs` into `lhs`.
#[track_caller]
pub fn add_(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary_inplace("add_inplace", OpKind::Add, lhs, rhs)
}

#[track_caller]
pub fn sub(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary("sub", OpKind::Sub, lhs, rhs)
}

#[track_caller]
pub fn mul(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary("mul", OpKind::Mul, lhs, rhs)
}

#[track_caller]
pub fn div(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary("div", OpKind::Div, lhs, rhs)
}

/// Remainder with the sign of the dividend.
#[track_caller]
pub fn fmod(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    binary("fmod", OpKind::Fmod, lhs, rhs)
}

#[track_caller]
pub fn neg(t: &Tensor) -> GraphResult<Tensor> {
    unary("neg", OpKind::Neg, t)
}

#[track_caller]
pub fn relu(t: &Tensor) -> GraphResult<Tensor> {
    unary("relu", OpKind::Relu, t)
}

#[track_caller]
pub fn relu_(t: &Tensor) -> GraphResult<Tensor> {
    inplace_op("relu_inplace", OpKind::Relu, &[t], t.info())
}

/// Identity that blocks gradients from flowing back into `t`.
#[track_caller]
pub fn detach(t: &Tensor) -> GraphResult<Tensor> {
    unary("detach", OpKind::Detach, t)
}

#[track_caller]
pub fn detach_(t: &Tensor) -> GraphResult<Tensor> {
    inplace_op("detach_inplace", OpKind::Detach, &[t], t.info())
}

#[track_caller]
pub fn cast(t: &Tensor, dtype: DType) -> GraphResult<Tensor> {
    let info = TensorInfo::new(dtype, t.shape());
    single_output_op("cast", OpKind::Cast { to: dtype }, &[t], info)
}

/// `a * x + b * y`.
#[track_caller]
pub fn scaled_add(x: &Tensor, y: &Tensor, a: f64, b: f64) -> GraphResult<Tensor> {
    binary("scaled_add", OpKind::ScaledAdd { a, b }, x, y)
}

/// `x = a * x + b * y`.
#[track_caller]
pub fn scaled_add_(x: &Tensor, y: &Tensor, a: f64, b: f64) -> GraphResult<Tensor> {
    binary_inplace("scaled_add_inplace", OpKind::ScaledAdd { a, b }, x, y)
}

#[track_caller]
pub fn logical_and(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    let (lhs, rhs) = (as_bool(lhs)?, as_bool(rhs)?);
    binary("logical_and", OpKind::LogicalAnd, &lhs, &rhs)
}

#[track_caller]
pub fn logical_or(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    let (lhs, rhs) = (as_bool(lhs)?, as_bool(rhs)?);
    binary("logical_or", OpKind::LogicalOr, &lhs, &rhs)
}

#[track_caller]
pub fn logical_not(t: &Tensor) -> GraphResult<Tensor> {
    let t = as_bool(t)?;
    unary("logical_not", OpKind::LogicalNot, &t)
}

/// Select `x` where `condition` holds and `y` elsewhere, broadcasting all three.
#[track_caller]
pub fn where_(condition: &Tensor, x: &Tensor, y: &Tensor) -> GraphResult<Tensor> {
    if condition.dtype() != DType::Bool {
        return Err(GraphError::DTypeMismatch {
            op: "where",
            expected: DType::Bool.name(),
            found: condition.dtype().name(),
        });
    }
    let dtype = check_same_dtype("where", x, y)?;
    let shape = broadcast_shapes("where", &condition.shape(), &x.shape())?;
    let shape = broadcast_shapes("where", &shape, &y.shape())?;
    single_output_op(
        "where",
        OpKind::Where,
        &[condition, x, y],
        TensorInfo::new(dtype, shape),
    )
}

/// Output shape of a numpy-style matrix product.
pub(crate) fn matmul_shape(a: &[usize], b: &[usize]) -> GraphResult<Vec<usize>> {
    if a.is_empty() || b.is_empty() {
        return Err(GraphError::ShapeMismatch {
            op: "matmul",
            reason: "operands must have at least one dimension".to_string(),
        });
    }
    let a2: Vec<usize> = if a.len() == 1 { vec![1, a[0]] } else { a.to_vec() };
    let b2: Vec<usize> = if b.len() == 1 { vec![b[0], 1] } else { b.to_vec() };
    let (n, m) = (a2.len(), b2.len());
    if a2[n - 1] != b2[m - 2] {
        return Err(GraphError::ShapeMismatch {
            op: "matmul",
            reason: format!("inner dimensions of {:?} and {:?} differ", a, b),
        });
    }
    let mut out = broadcast_shapes("matmul", &a2[..n - 2], &b2[..m - 2])?;
    if a.len() > 1 {
        out.push(a2[n - 2]);
    }
    if b.len() > 1 {
        out.push(b2[m - 1]);
    }
    Ok(out)
}

#[track_caller]
pub fn matmul(lhs: &Tensor, rhs: &Tensor) -> GraphResult<Tensor> {
    let dtype = check_same_dtype("matmul", lhs, rhs)?;
    let shape = matmul_shape(&lhs.shape(), &rhs.shape())?;
    single_output_op("matmul", OpKind::MatMul, &[lhs, rhs], TensorInfo::new(dtype, shape))
}
