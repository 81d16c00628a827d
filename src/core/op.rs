// This module defines operations. OpKind enumerates the operation types the builders in
// crate::ops can create, each carrying its attributes. OpSettings holds what the context
// contributes to a new op: the graph, the scope-joined name, the optional virtual graph id
// and pipeline stage, and the active debug info. DebugInfo records where an op builder was
// invoked (captured with #[track_caller]) together with its input and output tensor ids.
// Op is a handle (Ir + OpId) giving read access to an op's kind, settings and connected
// tensors, always in index order.

//! Operations and their settings.

use std::fmt;
use std::panic::Location;

use super::dtype::DType;
use super::graph::Graph;
use super::ir::{GraphId, Ir};
use super::tensor::Tensor;

/// Creation index of an op within its [`Ir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a recorded [`DebugInfo`] within its [`Ir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugInfoId(pub(crate) usize);

/// Initial contents of a tensor created by an `Init` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitType {
    Zero,
    NoInit,
}

/// Operation type with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Init { init: InitType },
    Add,
    Sub,
    Mul,
    Div,
    Fmod,
    Neg,
    Relu,
    MatMul,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    Cast { to: DType },
    ScaledAdd { a: f64, b: f64 },
    Where,
    /// Identity that stops gradient propagation.
    Detach,
    /// Per-axis `start..end` with step `+1` or `-1`; `end` is exclusive and may be `-1`
    /// for a reversed slice reaching index 0.
    Slice { starts: Vec<i64>, ends: Vec<i64>, steps: Vec<i64> },
    Subsample { strides: Vec<usize> },
    Squeeze { axes: Vec<usize> },
    Reshape { shape: Vec<usize> },
    Transpose { permutation: Vec<usize> },
    Gather { axis: usize },
    Call { callee: GraphId },
}

impl OpKind {
    /// Operator type name, as used in op names and statistics.
    pub fn op_type(&self) -> &'static str {
        match self {
            OpKind::Init { .. } => "Init",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Fmod => "Fmod",
            OpKind::Neg => "Neg",
            OpKind::Relu => "Relu",
            OpKind::MatMul => "MatMul",
            OpKind::LogicalAnd => "And",
            OpKind::LogicalOr => "Or",
            OpKind::LogicalNot => "Not",
            OpKind::Cast { .. } => "Cast",
            OpKind::ScaledAdd { .. } => "ScaledAdd",
            OpKind::Where => "Where",
            OpKind::Detach => "Detach",
            OpKind::Slice { .. } => "Slice",
            OpKind::Subsample { .. } => "Subsample",
            OpKind::Squeeze { .. } => "Squeeze",
            OpKind::Reshape { .. } => "Reshape",
            OpKind::Transpose { .. } => "Transpose",
            OpKind::Gather { .. } => "Gather",
            OpKind::Call { .. } => "Call",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_type())
    }
}

/// Settings an op is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSettings {
    pub graph: GraphId,
    pub name: String,
    pub virtual_graph_id: Option<i64>,
    pub pipeline_stage: Option<i64>,
    pub debug_info_id: Option<DebugInfoId>,
}

/// Source position of an op builder call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl From<&'static Location<'static>> for SourceLocation {
    fn from(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Debug record of one op builder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugInfo {
    pub name: String,
    pub location: SourceLocation,
    pub frame_offset: usize,
    pub parent: Option<DebugInfoId>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Handle to an operation of an [`Ir`].
#[derive(Clone)]
pub struct Op {
    ir: Ir,
    id: OpId,
}

impl Op {
    pub(crate) fn from_raw(ir: Ir, id: OpId) -> Self {
        Self { ir, id }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    pub fn kind(&self) -> OpKind {
        self.ir.store().op(self.id).kind.clone()
    }

    pub fn op_type(&self) -> &'static str {
        self.ir.store().op(self.id).kind.op_type()
    }

    pub fn name(&self) -> String {
        self.ir.store().op(self.id).settings.name.clone()
    }

    pub fn settings(&self) -> OpSettings {
        self.ir.store().op(self.id).settings.clone()
    }

    pub fn graph(&self) -> Graph {
        Graph::from_raw(self.ir.clone(), self.ir.store().op(self.id).graph)
    }

    pub fn input(&self, index: usize) -> Option<Tensor> {
        let id = self.ir.store().op(self.id).inputs.get(&index).cloned()?;
        Tensor::from_raw(&self.ir, &id).ok()
    }

    pub fn output(&self, index: usize) -> Option<Tensor> {
        let id = self.ir.store().op(self.id).outputs.get(&index).cloned()?;
        Tensor::from_raw(&self.ir, &id).ok()
    }

    /// Connected inputs in index order.
    pub fn inputs(&self) -> Vec<Tensor> {
        let ids: Vec<String> = self.ir.store().op(self.id).inputs.values().cloned().collect();
        self.resolve(ids)
    }

    /// Connected outputs in index order.
    pub fn outputs(&self) -> Vec<Tensor> {
        let ids: Vec<String> = self.ir.store().op(self.id).outputs.values().cloned().collect();
        self.resolve(ids)
    }

    pub fn input_indices(&self) -> Vec<usize> {
        self.ir.store().op(self.id).inputs.keys().copied().collect()
    }

    /// Input indices whose tensors this op modifies in place.
    pub fn modified_inputs(&self) -> Vec<usize> {
        self.ir.store().op(self.id).modified_inputs.iter().copied().collect()
    }

    /// The graph invoked by a call op.
    pub fn called_graph(&self) -> Option<Graph> {
        match self.ir.store().op(self.id).kind {
            OpKind::Call { callee } => Some(Graph::from_raw(self.ir.clone(), callee)),
            _ => None,
        }
    }

    fn resolve(&self, ids: Vec<String>) -> Vec<Tensor> {
        ids.iter()
            .filter_map(|id| match Tensor::from_raw(&self.ir, id) {
                Ok(t) => Some(t),
                Err(err) => {
                    debug_assert!(false, "dangling tensor id {} in op {}: {}", id, self.name(), err);
                    log::error!("Dangling tensor id {} in op {}: {}", id, self.name(), err);
                    None
                }
            })
            .collect()
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ir == other.ir
    }
}

impl Eq for Op {}

impl std::hash::Hash for Op {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.ir.hash(state);
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op[{} {} #{}]", self.op_type(), self.name(), self.id.0)
    }
}
