// This module defines the error taxonomy of the graph construction front-end using the
// thiserror crate. GraphError covers usage errors of the context API (empty graph stack,
// nesting graphs of different IRs, unknown hook handles, passing "unset" to in_sequence),
// graph membership errors raised while binding tensors, type and coercion errors (dtype
// resolution, invalid index keys, empty operands), shape inference failures of the op
// builders, and call-site binding errors. Each variant carries the offending ids or values
// so the Display output names the violated precondition. GraphResult<T> is the alias used
// throughout the crate.

//! Error types for graph construction.

use thiserror::Error;

/// Main error type for graph construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error(
        "Trying to access the {what}, but no graph has been selected. Hint - try performing \
         the operations inside a graph scope (e.g. `let _g = graph.enter()?;`) or inside of \
         a function passed to `Ir::create_graph`"
    )]
    NoActiveGraph { what: &'static str },

    #[error(
        "Trying to enter a graph of Ir[id={new}] nested in a graph scope of Ir[id={active}]. \
         Nested graph scopes must belong to the same Ir"
    )]
    MismatchedIr { active: u64, new: u64 },

    #[error("Unknown op created hook {handle}")]
    UnknownHook { handle: u64 },

    #[error("None cannot be passed to `in_sequence`. Try `false` instead")]
    UnsetInSequence,

    #[error("Tensor {tensor} is not in the Graph {graph}")]
    TensorNotInGraph { tensor: String, graph: String },

    #[error("Tensor {tensor} is not an input or output of the called graph {graph}")]
    NotGraphIo { tensor: String, graph: String },

    #[error("Tensor id {id} is not within the scope of graph {graph}")]
    NotInScope { id: String, graph: String },

    #[error("Tensor {id} does not exist in Ir[id={ir}]")]
    TensorNotFound { id: String, ir: u64 },

    #[error("There is not a dtype that is compatible with {value} (of kind {kind})")]
    DTypeResolution { value: String, kind: &'static str },

    #[error("`{dtype}` does not have a corresponding host element type")]
    NoHostType { dtype: &'static str },

    #[error(
        "Only integers, slices (ranges), integer tensors and boolean tensors are valid \
         indices. Not a valid type: {kind}. Value: {value}"
    )]
    InvalidIndexKey { kind: &'static str, value: String },

    #[error(
        "The value has 0 elements - this is most likely a mistake. If not, create the \
         tensor explicitly before using it in an operation. Kind: {kind}. Value: {value}"
    )]
    EmptyOperand { kind: &'static str, value: String },

    #[error(
        "You cannot create a variable tensor within a subgraph. It can only be created \
         within the main graph. Create a graph input (`graph_input`) or a constant instead"
    )]
    VariableOutsideMainGraph,

    #[error("Tensor is a scalar and doesn't have a length")]
    ScalarLength,

    #[error("Index {index} is out of range for axis {axis} with size {size}")]
    IndexOutOfRange { axis: usize, index: i64, size: usize },

    #[error("Shape mismatch in {op}: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },

    #[error("DType mismatch in {op}: expected {expected}, found {found}")]
    DTypeMismatch { op: &'static str, expected: &'static str, found: &'static str },

    #[error("Invalid attribute for {op}: {reason}")]
    InvalidAttribute { op: &'static str, reason: String },

    #[error("Host data error: {reason}")]
    HostData { reason: String },

    #[error(
        "Callable passed to `create_graph` has no resolvable qualified name. Use \
         `create_graph_named` to name the graph explicitly"
    )]
    UnnamedGraphFunction,

    #[error("Call to {graph} binds input index {index}, but the graph only has {count} inputs")]
    CallInputIndex { graph: String, index: usize, count: usize },

    #[error("Call to {graph} leaves subgraph input {tensor} (index {index}) unbound")]
    UnboundCallInput { graph: String, tensor: String, index: usize },

    #[error("Unsupported operation for {component}: {op}")]
    Unsupported { component: &'static str, op: String },

    #[error("Missing value for tensor {id} during evaluation")]
    MissingValue { id: String },
}

/// Result type alias for graph construction.
pub type GraphResult<T> = Result<T, GraphError>;
