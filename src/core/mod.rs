// This module serves as the central hub of the graph construction front-end's identity model,
// providing the value objects every other layer builds on. It exports and organizes the key
// subsystems: element types (DType and its resolution tables), host data (HostArray), the IR
// container and its store (Ir, IrOptions), graphs with their naming rules and topological
// constraints (Graph, TopoCons), operations (Op, OpKind, OpSettings, DebugInfo) and tensors
// with their memoized storage-kind variants (Tensor, Variable, Constant). Handles are cheap
// Rc clones; identity and hashing are by id within an Ir, and the Ir id across Irs.

//! Core identity model.
//!
//! # Key Components
//!
//! ## Element types (`dtype`)
//! - `DType` resolution from names, scalar kinds, internal tags and host data
//!
//! ## Host data (`host`)
//! - Dense little-endian arrays used to initialise variables and constants
//!
//! ## IR store (`ir`, `graph`, `op`, `tensor`)
//! - `Ir` owns graphs, ops and tensors
//! - `Graph` is the single entry point for inserting ops
//! - `Tensor` lookups are memoized so equal ids yield the same object

pub mod dtype;
pub mod error;
pub mod graph;
pub mod host;
pub mod ir;
pub mod op;
pub mod tensor;

pub use dtype::{DType, DTypeLike, DataType, HostType, ScalarKind};
pub use error::{GraphError, GraphResult};
pub use graph::{check_in_graph, Graph, TopoCon, TopoCons};
pub use host::{HostArray, HostElement, Scalar};
pub use ir::{GraphId, Ir, IrOptions};
pub use op::{DebugInfo, DebugInfoId, InitType, Op, OpId, OpKind, OpSettings, SourceLocation};
pub use tensor::{
    Constant, ReplicaGrouping, Tensor, TensorInfo, TensorKind, TensorSpec, TensorType, Variable,
};
