//! devgraph - graph construction front-end for a device graph compiler.
//!
//! devgraph builds typed dataflow graphs of tensors and operations. Ops are
//! created in the graph at the top of a thread-local context stack, which
//! also carries placement settings, name scopes and the in-sequence mode
//! that chains ops with topological constraints. Plain Rust functions become
//! subgraphs with [`Ir::create_graph`] and are invoked with [`ops::call`].
//!
//! # Primary Usage
//!
//! ```ignore
//! use devgraph::{builder, ops, Args, DType, Ir};
//!
//! let ir = Ir::new();
//! let main = ir.main_graph();
//! let _g = main.enter()?;
//!
//! let x = builder::variable(vec![1.0f32, 2.0], None, Some("x"))?;
//! let double = ir.create_graph(
//!     |args: &Args| args.tensor(0)?.mul(2.0f32),
//!     Args::from_tensors(&[&x]),
//! )?;
//! let y = ops::call(&double, &[&x], &[])?.one();
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Ir, graphs, tensors, ops, dtypes and host data
//! - [`context`] - Thread-local context stack and op-created hooks
//! - [`builder`] - Subgraphs from closures, variables, constants, graph I/O
//! - [`ops`] - Operation builders, operator overloads and indexing
//! - [`session`] - Arena-backed export for the external compiler
//! - [`interp`] - Host-side reference execution

pub mod builder;
pub mod context;
pub mod core;
pub mod interp;
pub mod ops;
pub mod session;

pub use builder::{Arg, Args, IntoGraphOutputs};
pub use context::{ContextGuard, HookHandle};
pub use self::core::{
    Constant, DType, Graph, GraphError, GraphId, GraphResult, HostArray, Ir, IrOptions, Op,
    OpKind, ReplicaGrouping, Tensor, TensorInfo, TensorSpec, Variable,
};
pub use interp::HostExecutor;
pub use ops::{CallInfo, CallOutputs, IndexKey, SliceRange};
pub use session::{ExportSession, GraphCompiler, ProgramDesc, SessionStats};
