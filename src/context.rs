// This module implements the graph construction context: one Context per thread, held in a
// thread-local RefCell and reached through free functions. The context keeps the stack of
// entered graphs (all from one Ir), the ambient placement settings (virtual graph id and
// pipeline stage), the name-scope path, the in-sequence flag with its per-graph ledger of
// previous ops, the active debug info and frame offset, and the table of op-created hooks.
// Scoped mutators return a ContextGuard that restores the previous value when dropped, so
// state is restored on normal return, on `?` early return and while unwinding a panic.
// notify_op_created is called by the op funnel in core::graph for every inserted op: it adds
// the in-sequence topological constraints first and then runs every hook in registration
// order, outside the context borrow so hooks may build more ops.

//! Thread-local graph construction context.
//!
//! Ops are always created in the graph at the top of the context's graph
//! stack. Enter a graph with [`Graph::enter`] or [`Graph::within`]:
//!
//! ```rust,ignore
//! let ir = Ir::new();
//! let main = ir.main_graph();
//! let _g = main.enter()?;
//! let _seq = context::in_sequence(true)?;
//! let x = builder::variable(1.0f32, None, Some("x"))?;
//! let y = (&*x + 1.0f32)?;
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::core::{
    DebugInfo, DebugInfoId, Graph, GraphError, GraphId, GraphResult, Ir, Op, OpId, OpSettings,
    SourceLocation, Tensor,
};

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// Callback run for every op created.
pub type OpCreatedHook = Rc<dyn Fn(&Op)>;

/// Handle returned by [`register_op_created_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

/// Graph construction state of one thread.
#[derive(Default)]
pub struct Context {
    graphs: Vec<Graph>,
    virtual_graph_id: Option<i64>,
    pipeline_stage: Option<i64>,
    in_sequence: Option<bool>,
    previous_ops: HashMap<(u64, GraphId), Vec<OpId>>,
    name_scopes: Vec<String>,
    debug_info: Option<DebugInfoId>,
    debug_frame_offset: usize,
    next_hook: u64,
    hooks: BTreeMap<u64, OpCreatedHook>,
}

impl Context {
    /// Entered graphs, bottom first.
    pub fn graphs(&self) -> &[Graph] {
        &self.graphs
    }

    pub fn virtual_graph_id(&self) -> Option<i64> {
        self.virtual_graph_id
    }

    pub fn pipeline_stage(&self) -> Option<i64> {
        self.pipeline_stage
    }

    pub fn in_sequence(&self) -> Option<bool> {
        self.in_sequence
    }

    pub fn name_scopes(&self) -> &[String] {
        &self.name_scopes
    }

    pub fn debug_info(&self) -> Option<DebugInfoId> {
        self.debug_info
    }

    pub fn debug_frame_offset(&self) -> usize {
        self.debug_frame_offset
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Previous ops recorded for `graph` while in-sequence mode is active.
    pub fn previous_ops(&self, graph: &Graph) -> Vec<OpId> {
        self.previous_ops
            .get(&(graph.ir().id(), graph.id()))
            .cloned()
            .unwrap_or_default()
    }

    fn push_graph(&mut self, graph: &Graph) -> GraphResult<()> {
        if let Some(bottom) = self.graphs.first() {
            if bottom.ir() != graph.ir() {
                return Err(GraphError::MismatchedIr {
                    active: bottom.ir().id(),
                    new: graph.ir().id(),
                });
            }
        }
        self.graphs.push(graph.clone());
        Ok(())
    }

    fn current_graph(&self) -> GraphResult<Graph> {
        self.graphs
            .last()
            .cloned()
            .ok_or(GraphError::NoActiveGraph { what: "current graph" })
    }

    fn main_graph(&self) -> GraphResult<Graph> {
        self.graphs
            .first()
            .map(|g| g.ir().main_graph())
            .ok_or(GraphError::NoActiveGraph { what: "main graph" })
    }

    fn set_in_sequence(&mut self, enabled: Option<bool>) {
        if enabled.is_none() {
            self.previous_ops.clear();
        }
        if self.in_sequence.is_none() && enabled == Some(false) {
            return;
        }
        self.in_sequence = enabled;
    }

    fn add_in_sequence_topocons(&mut self, op: &Op) {
        let Some(strict) = self.in_sequence else {
            return;
        };
        let graph = op.graph();
        let ledger = self
            .previous_ops
            .entry((graph.ir().id(), graph.id()))
            .or_default();
        if strict {
            for before in ledger.drain(..) {
                graph.insert_topo_con(before, op.id(), false);
            }
        } else if let Some(&first) = ledger.first() {
            graph.insert_topo_con(first, op.id(), false);
        }
        ledger.push(op.id());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("graphs", &self.graphs)
            .field("virtual_graph_id", &self.virtual_graph_id)
            .field("pipeline_stage", &self.pipeline_stage)
            .field("in_sequence", &self.in_sequence)
            .field("name_scopes", &self.name_scopes)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Run `f` with the thread's context.
///
/// Must not be called re-entrantly from inside `f`.
pub fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|ctx| f(&mut ctx.borrow_mut()))
}

/// Restore the thread's context to its initial state.
pub fn reset_context() {
    with_context(|ctx| *ctx = Context::default());
}

/// RAII guard restoring a piece of context state when dropped.
///
/// Guards restore in reverse order of creation when they go out of scope
/// together, including while a panic unwinds. Stack guards (graphs and name
/// scopes) truncate to the depth they saw when created, so dropping an outer
/// guard first also removes everything pushed after it.
#[must_use = "the context change is undone as soon as the guard is dropped"]
pub struct ContextGuard {
    restore: Option<Box<dyn FnOnce(&mut Context)>>,
}

impl ContextGuard {
    fn new(restore: impl FnOnce(&mut Context) + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            // The thread-local may already be gone during thread teardown.
            let _ = CONTEXT.try_with(|ctx| match ctx.try_borrow_mut() {
                Ok(mut ctx) => restore(&mut ctx),
                Err(_) => log::warn!(
                    "Context is borrowed while a guard is dropped; scoped state was not restored"
                ),
            });
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("active", &self.restore.is_some())
            .finish()
    }
}

/// Push `graph` on the graph stack.
///
/// Fails if the stack holds graphs of another Ir.
pub fn push_graph(graph: &Graph) -> GraphResult<()> {
    with_context(|ctx| ctx.push_graph(graph))?;
    log::trace!("Entered graph {}", graph.name());
    Ok(())
}

/// Pop the top of the graph stack.
pub fn pop_graph() -> Option<Graph> {
    with_context(|ctx| ctx.graphs.pop())
}

pub(crate) fn enter_graph(graph: &Graph) -> GraphResult<ContextGuard> {
    let depth = with_context(|ctx| ctx.graphs.len());
    push_graph(graph)?;
    Ok(ContextGuard::new(move |ctx| ctx.graphs.truncate(depth)))
}

/// The graph ops are currently added to.
pub fn current_graph() -> GraphResult<Graph> {
    with_context(|ctx| ctx.current_graph())
}

/// The main graph of the Ir being built.
pub fn main_graph() -> GraphResult<Graph> {
    with_context(|ctx| ctx.main_graph())
}

/// The Ir being built.
pub fn current_ir() -> GraphResult<Ir> {
    current_graph().map(|g| g.ir().clone())
}

/// Place ops created while the guard lives on virtual graph `id`.
pub fn virtual_graph(id: i64) -> ContextGuard {
    let prev = with_context(|ctx| ctx.virtual_graph_id.replace(id));
    ContextGuard::new(move |ctx| ctx.virtual_graph_id = prev)
}

/// Assign ops created while the guard lives to pipeline stage `stage`.
pub fn pipeline_stage(stage: i64) -> ContextGuard {
    let prev = with_context(|ctx| ctx.pipeline_stage.replace(stage));
    ContextGuard::new(move |ctx| ctx.pipeline_stage = prev)
}

/// Prefix op and tensor names with `name` while the guard lives.
pub fn name_scope(name: &str) -> ContextGuard {
    let depth = with_context(|ctx| {
        ctx.name_scopes.push(name.to_string());
        ctx.name_scopes.len() - 1
    });
    ContextGuard::new(move |ctx| ctx.name_scopes.truncate(depth))
}

/// Set the in-sequence flag while the guard lives.
///
/// `true` orders every new op after all ops recorded in the graph's ledger.
/// `false` orders new ops only after the first ledger entry, leaving them
/// unordered among themselves. Passing `None` is an error.
pub fn in_sequence(enabled: impl Into<Option<bool>>) -> GraphResult<ContextGuard> {
    let enabled = enabled.into().ok_or(GraphError::UnsetInSequence)?;
    let prev = with_context(|ctx| {
        let prev = ctx.in_sequence;
        ctx.set_in_sequence(Some(enabled));
        prev
    });
    Ok(ContextGuard::new(move |ctx| ctx.set_in_sequence(prev)))
}

pub fn with_virtual_graph<R>(id: i64, f: impl FnOnce() -> R) -> R {
    let _guard = virtual_graph(id);
    f()
}

pub fn with_pipeline_stage<R>(stage: i64, f: impl FnOnce() -> R) -> R {
    let _guard = pipeline_stage(stage);
    f()
}

pub fn with_name_scope<R>(name: &str, f: impl FnOnce() -> R) -> R {
    let _guard = name_scope(name);
    f()
}

pub fn with_in_sequence<R>(
    enabled: impl Into<Option<bool>>,
    f: impl FnOnce() -> GraphResult<R>,
) -> GraphResult<R> {
    let _guard = in_sequence(enabled)?;
    f()
}

/// Current name-scope path, outermost first.
pub fn name_scopes() -> Vec<String> {
    with_context(|ctx| ctx.name_scopes.clone())
}

/// Register `hook` to run for every op created on this thread.
pub fn register_op_created_hook(hook: impl Fn(&Op) + 'static) -> HookHandle {
    with_context(|ctx| {
        let handle = ctx.next_hook;
        ctx.next_hook += 1;
        ctx.hooks.insert(handle, Rc::new(hook));
        HookHandle(handle)
    })
}

/// Remove a hook registered with [`register_op_created_hook`].
pub fn remove_op_created_hook(handle: HookHandle) -> GraphResult<()> {
    with_context(|ctx| ctx.hooks.remove(&handle.0))
        .map(|_| ())
        .ok_or(GraphError::UnknownHook { handle: handle.0 })
}

/// Settings for a new op named `name` in the current graph.
pub fn compute_op_settings(name: &str) -> GraphResult<OpSettings> {
    with_context(|ctx| {
        let graph = ctx.current_graph()?;
        Ok(OpSettings {
            graph: graph.id(),
            name: scoped_name(&ctx.name_scopes, name),
            virtual_graph_id: ctx.virtual_graph_id,
            pipeline_stage: ctx.pipeline_stage,
            debug_info_id: ctx.debug_info,
        })
    })
}

fn scoped_name(scopes: &[String], name: &str) -> String {
    if scopes.is_empty() {
        return name.to_string();
    }
    let mut parts: Vec<&str> = scopes.iter().map(String::as_str).collect();
    parts.push(name);
    parts.join("/")
}

/// Called by the op funnel once per inserted op.
pub(crate) fn notify_op_created(op: &Op) {
    let hooks: Vec<OpCreatedHook> = with_context(|ctx| {
        ctx.add_in_sequence_topocons(op);
        ctx.hooks.values().cloned().collect()
    });
    log::trace!("Created {:?} in graph {}", op, op.graph().name());
    for hook in hooks {
        hook(op);
    }
}

/// Debug record made active while an op builder runs.
#[must_use = "the debug info is deactivated as soon as the context is dropped"]
pub struct DebugContext {
    _guard: ContextGuard,
    ir: Ir,
    id: DebugInfoId,
}

impl DebugContext {
    pub fn id(&self) -> DebugInfoId {
        self.id
    }

    /// Record the tensors the op builder produced.
    pub fn record_outputs(&self, outputs: &[&Tensor]) {
        let mut store = self.ir.store_mut();
        if let Some(info) = store.debug_infos.get_mut(self.id.0) {
            info.outputs = outputs.iter().map(|t| t.id().to_string()).collect();
        }
    }
}

/// Record a debug info for an op builder named `name` and make it active.
///
/// The source location is the caller's; builders marked `#[track_caller]`
/// forward the location of their own caller.
#[track_caller]
pub fn op_debug_context(name: &str, inputs: &[&Tensor]) -> GraphResult<DebugContext> {
    let location = SourceLocation::from(Location::caller());
    let ir = current_ir()?;
    let (scoped, frame_offset, parent) = with_context(|ctx| {
        (
            scoped_name(&ctx.name_scopes, name),
            ctx.debug_frame_offset,
            ctx.debug_info,
        )
    });
    let id = {
        let mut store = ir.store_mut();
        let id = DebugInfoId(store.debug_infos.len());
        store.debug_infos.push(DebugInfo {
            name: scoped,
            location,
            frame_offset,
            parent,
            inputs: inputs.iter().map(|t| t.id().to_string()).collect(),
            outputs: Vec::new(),
        });
        id
    };
    let prev = with_context(|ctx| ctx.debug_info.replace(id));
    Ok(DebugContext {
        _guard: ContextGuard::new(move |ctx| ctx.debug_info = prev),
        ir,
        id,
    })
}

/// Skip `offset + 1` more frames when attributing source locations.
pub fn debug_context_frame_offset(offset: usize) -> ContextGuard {
    with_context(|ctx| ctx.debug_frame_offset += offset + 1);
    ContextGuard::new(move |ctx| {
        ctx.debug_frame_offset = ctx.debug_frame_offset.saturating_sub(offset + 1)
    })
}
