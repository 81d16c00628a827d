// This module groups the operation builders. Every builder follows the same steps: open an op
// debug context recording the caller's source location, compute the op settings from the
// context, infer the output tensor info (raising ShapeMismatch, DTypeMismatch or
// InvalidAttribute on bad operands) and insert the op through Graph::create_connected_op, the
// funnel that fires the op-created notification exactly once. Builders are free functions;
// Tensor gets named methods and operator overloads on top of them in `overload`, and
// indexing in `index`.

//! Operation builders.

pub mod call;
pub mod elementwise;
pub mod index;
pub mod init;
pub mod overload;
pub mod shape;

pub use call::{call, call_with_info, CallInfo, CallOutputs};
pub use elementwise::{
    add, add_, cast, detach, detach_, div, fmod, logical_and, logical_not, logical_or, matmul,
    mul, neg, relu, relu_, scaled_add, scaled_add_, sub, where_,
};
pub use index::IndexKey;
pub use init::init;
pub use overload::{ensure_tensor, Operand};
pub use shape::{
    flatten, flatten_, gather, reshape, reshape_, slice, squeeze, subsample, transpose, transpose_,
    SliceRange,
};

use crate::context;
use crate::core::{GraphError, GraphResult, OpKind, Tensor, TensorInfo};

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(op: &'static str, a: &[usize], b: &[usize]) -> GraphResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(GraphError::ShapeMismatch {
                    op,
                    reason: format!("shapes {:?} and {:?} cannot be broadcast", a, b),
                })
            }
        };
    }
    Ok(out)
}

/// Insert a single-output op in the current graph and return its output.
#[track_caller]
pub(crate) fn single_output_op(
    name: &'static str,
    kind: OpKind,
    inputs: &[&Tensor],
    output: TensorInfo,
) -> GraphResult<Tensor> {
    output_op(name, kind, inputs, output, &[])
}

/// Insert a single-output op writing to `inputs[0]`. The output aliases the input,
/// so view ops built this way expose the modified tensor under its new shape.
#[track_caller]
pub(crate) fn aliasing_op(
    name: &'static str,
    kind: OpKind,
    inputs: &[&Tensor],
    output: TensorInfo,
) -> GraphResult<Tensor> {
    output_op(name, kind, inputs, output, &[0])
}

#[track_caller]
fn output_op(
    name: &'static str,
    kind: OpKind,
    inputs: &[&Tensor],
    output: TensorInfo,
    modified: &[usize],
) -> GraphResult<Tensor> {
    let dc = context::op_debug_context(name, inputs)?;
    let graph = context::current_graph()?;
    let settings = context::compute_op_settings(name)?;
    let out_name = format!("{}_out", name);
    let (_, outputs) = graph.create_modifying_op(
        kind,
        settings,
        inputs,
        &[(out_name.as_str(), output)],
        modified,
    )?;
    let out = outputs
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::MissingValue { id: out_name.clone() })?;
    dc.record_outputs(&[&out]);
    Ok(out)
}

/// Insert an op that overwrites `inputs[0]` with its result and has no outputs of
/// its own. The result must keep the shape and dtype of `inputs[0]`; the modified
/// tensor itself is returned.
#[track_caller]
pub(crate) fn inplace_op(
    name: &'static str,
    kind: OpKind,
    inputs: &[&Tensor],
    result: TensorInfo,
) -> GraphResult<Tensor> {
    let target = match inputs.first() {
        Some(t) => (*t).clone(),
        None => {
            return Err(GraphError::InvalidAttribute {
                op: name,
                reason: "an in-place op needs an input to modify".to_string(),
            })
        }
    };
    if result.dtype() != target.dtype() || result.shape() != &target.shape()[..] {
        return Err(GraphError::ShapeMismatch {
            op: name,
            reason: format!(
                "result {:?} {:?} cannot be written into {} {:?} {:?}",
                result.dtype(),
                result.shape(),
                target.id(),
                target.dtype(),
                target.shape()
            ),
        });
    }
    let dc = context::op_debug_context(name, inputs)?;
    let graph = context::current_graph()?;
    let settings = context::compute_op_settings(name)?;
    graph.create_modifying_op(kind, settings, inputs, &[], &[0])?;
    dc.record_outputs(&[&target]);
    Ok(target)
}
