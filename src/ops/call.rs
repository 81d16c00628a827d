// This module implements the call site of a subgraph. call_with_info creates a call op in the
// current (parent) graph named `<parent>--call--<subgraph>`, binds the positional parent
// tensors to subgraph inputs 0..N-1 purely by index, binds the explicit subgraph-tensor to
// parent-tensor mapping after checking both memberships, and creates one parent output per
// subgraph output, named after the subgraph output's local name. Setup then checks that every
// subgraph input is bound, records by-reference inputs as modified inputs of the call and
// logs a warning for bindings whose shape or dtype differ from the subgraph input. Positional
// order is not reconciled by name: that correspondence is the caller's contract.

//! Subgraph call sites.

use std::fmt;

use crate::context;
use crate::core::tensor::ShapeDisplay;
use crate::core::{check_in_graph, Graph, GraphError, GraphResult, Op, OpKind, Tensor};

/// Outputs of a call: nothing, one tensor, or several in subgraph output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutputs {
    None,
    One(Tensor),
    Many(Vec<Tensor>),
}

impl CallOutputs {
    fn from_vec(mut outputs: Vec<Tensor>) -> Self {
        match outputs.len() {
            0 => CallOutputs::None,
            1 => CallOutputs::One(outputs.remove(0)),
            _ => CallOutputs::Many(outputs),
        }
    }

    /// The single output, if there is exactly one.
    pub fn one(self) -> Option<Tensor> {
        match self {
            CallOutputs::One(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Vec<Tensor> {
        match self {
            CallOutputs::None => Vec::new(),
            CallOutputs::One(t) => vec![t],
            CallOutputs::Many(ts) => ts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CallOutputs::None => 0,
            CallOutputs::One(_) => 1,
            CallOutputs::Many(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Introspection of a call site.
#[derive(Clone)]
pub struct CallInfo {
    op: Op,
}

impl CallInfo {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn called_graph(&self) -> GraphResult<Graph> {
        self.op.called_graph().ok_or_else(|| GraphError::Unsupported {
            component: "CallInfo",
            op: self.op.op_type().to_string(),
        })
    }

    /// The call-site tensor bound to `subgraph_tensor`, an input or output of the called graph.
    pub fn subgraph_to_op_tensor(&self, subgraph_tensor: &Tensor) -> GraphResult<Tensor> {
        let graph = self.called_graph()?;
        let bound = if let Some(idx) = graph.input_index(subgraph_tensor.id()) {
            self.op.input(idx)
        } else if let Some(idx) = graph.output_index(subgraph_tensor.id()) {
            self.op.output(idx)
        } else {
            None
        };
        bound.ok_or_else(|| GraphError::NotGraphIo {
            tensor: subgraph_tensor.name(),
            graph: graph.name(),
        })
    }

    /// Call inputs in index order.
    pub fn inputs(&self) -> Vec<Tensor> {
        self.op.inputs()
    }

    /// Call outputs in index order.
    pub fn outputs(&self) -> Vec<Tensor> {
        self.op.outputs()
    }

    pub fn into_outputs(self) -> CallOutputs {
        CallOutputs::from_vec(self.op.outputs())
    }
}

impl fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInfo").field("op", &self.op).finish()
    }
}

/// Call `subgraph` with `inputs` bound positionally and `mapping` binding
/// (subgraph tensor, parent tensor) pairs.
#[track_caller]
pub fn call(
    subgraph: &Graph,
    inputs: &[&Tensor],
    mapping: &[(&Tensor, &Tensor)],
) -> GraphResult<CallOutputs> {
    call_with_info(subgraph, inputs, mapping).map(CallInfo::into_outputs)
}

/// Like [`call`], returning the call site for introspection.
#[track_caller]
pub fn call_with_info(
    subgraph: &Graph,
    inputs: &[&Tensor],
    mapping: &[(&Tensor, &Tensor)],
) -> GraphResult<CallInfo> {
    let dc = context::op_debug_context("call", inputs)?;
    let parent = context::current_graph()?;
    if parent.ir() != subgraph.ir() {
        return Err(GraphError::MismatchedIr {
            active: parent.ir().id(),
            new: subgraph.ir().id(),
        });
    }
    let name = format!("{}--call--{}", parent.name(), subgraph.name());
    let settings = context::compute_op_settings(&name)?;
    let op = parent.create_op(
        OpKind::Call {
            callee: subgraph.id(),
        },
        settings,
    );

    let input_count = subgraph.input_ids().len();
    for (index, tensor) in inputs.iter().enumerate() {
        if index >= input_count {
            return Err(GraphError::CallInputIndex {
                graph: subgraph.name(),
                index,
                count: input_count,
            });
        }
        parent.connect_input(op.id(), index, tensor)?;
    }

    for (sg_tensor, parent_tensor) in mapping {
        check_in_graph(&parent, parent_tensor)?;
        check_in_graph(subgraph, sg_tensor)?;
        let index = subgraph
            .input_index(sg_tensor.id())
            .ok_or_else(|| GraphError::NotGraphIo {
                tensor: sg_tensor.name(),
                graph: subgraph.name(),
            })?;
        parent.connect_input(op.id(), index, parent_tensor)?;
    }

    for (index, sg_output) in subgraph.outputs().iter().enumerate() {
        let local = subgraph.remove_scope(sg_output.id())?;
        parent.create_output(op.id(), index, &local, sg_output.info())?;
    }

    setup(&parent, &op, subgraph)?;
    log::debug!(
        "Built call {} with {} inputs and {} outputs",
        name,
        op.inputs().len(),
        op.outputs().len()
    );
    let outputs = op.outputs();
    dc.record_outputs(&outputs.iter().collect::<Vec<_>>());
    Ok(CallInfo { op })
}

fn setup(parent: &Graph, op: &Op, subgraph: &Graph) -> GraphResult<()> {
    for (index, sg_input) in subgraph.inputs().iter().enumerate() {
        let Some(bound) = op.input(index) else {
            return Err(GraphError::UnboundCallInput {
                graph: subgraph.name(),
                tensor: sg_input.id().to_string(),
                index,
            });
        };
        let (expected, found) = (sg_input.info(), bound.info());
        if expected.shape() != found.shape() || expected.dtype() != found.dtype() {
            log::warn!(
                "Call to {}: input {} binds {} {} to {} {}",
                subgraph.name(),
                index,
                found.dtype(),
                ShapeDisplay(found.shape()),
                expected.dtype(),
                ShapeDisplay(expected.shape())
            );
        }
        if subgraph.is_by_ref_input(sg_input.id()) {
            parent.mark_modified_input(op.id(), index);
            for reader in bound.consumers() {
                if reader.id() != op.id() {
                    parent.insert_topo_con(reader.id(), op.id(), false);
                }
            }
        }
    }
    Ok(())
}
