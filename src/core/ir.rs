// This module implements the Ir, the owner of every graph, tensor and operation built by the
// front-end. An Ir is a shared, single-threaded handle (Rc) over an IrStore kept in a
// RefCell: graphs are stored by index (GraphId), operations by creation index (OpId) and
// tensors by fully qualified id. Each Ir gets a process-unique numeric id from a global
// atomic counter, which together with a tensor id defines tensor identity. The Ir also keeps
// the memo table that maps a tensor id to its shared Tensor state so repeated lookups return
// the same object, the per-name counters used to make subgraph ids unique, and the debug
// infos recorded by op debug contexts. IrOptions carries the construction-time settings.

//! The IR container and its backing store.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;

use super::error::{GraphError, GraphResult};
use super::graph::{Graph, TopoCons};
use super::host::HostArray;
use super::op::{DebugInfo, DebugInfoId, OpId, OpKind, OpSettings};
use super::tensor::{TensorInfo, TensorState, TensorType};

static NEXT_IR_ID: AtomicU64 = AtomicU64::new(0);

/// Index of a graph within its [`Ir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub(crate) usize);

impl GraphId {
    /// The main graph is always created first.
    pub const MAIN: GraphId = GraphId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Construction-time settings of an [`Ir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrOptions {
    /// Number of model replicas; the default replica grouping of variables spans all of them.
    pub replication_factor: u32,
    /// Narrow 64-bit host data to 32 bits when no dtype is given.
    pub downcast_host_data: bool,
}

impl Default for IrOptions {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            downcast_host_data: true,
        }
    }
}

impl IrOptions {
    pub fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor.max(1);
        self
    }

    pub fn with_downcast_host_data(mut self, downcast: bool) -> Self {
        self.downcast_host_data = downcast;
        self
    }
}

/// Stored graph record.
pub(crate) struct GraphData {
    pub(crate) scope: String,
    pub(crate) name: String,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) by_ref_inputs: HashSet<String>,
    pub(crate) tensors: Vec<String>,
    pub(crate) ops: Vec<OpId>,
    pub(crate) topo_cons: TopoCons,
}

/// Stored tensor record.
pub(crate) struct TensorData {
    pub(crate) graph: GraphId,
    pub(crate) info: TensorInfo,
    pub(crate) tensor_type: TensorType,
    pub(crate) data: Option<HostArray>,
    pub(crate) producer: Option<(OpId, usize)>,
    pub(crate) consumers: Vec<(OpId, usize)>,
}

/// Stored operation record.
pub(crate) struct OpData {
    pub(crate) graph: GraphId,
    pub(crate) kind: OpKind,
    pub(crate) settings: OpSettings,
    pub(crate) inputs: BTreeMap<usize, String>,
    pub(crate) outputs: BTreeMap<usize, String>,
    pub(crate) modified_inputs: BTreeSet<usize>,
}

/// Everything owned by an [`Ir`].
pub(crate) struct IrStore {
    pub(crate) graphs: Vec<GraphData>,
    pub(crate) tensors: HashMap<String, TensorData>,
    pub(crate) ops: Vec<OpData>,
    pub(crate) subgraph_counters: HashMap<String, usize>,
    pub(crate) tensor_counters: HashMap<String, usize>,
    pub(crate) debug_infos: Vec<DebugInfo>,
}

impl IrStore {
    fn new() -> Self {
        let main = GraphData {
            scope: String::new(),
            name: "main_graph".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            by_ref_inputs: HashSet::new(),
            tensors: Vec::new(),
            ops: Vec::new(),
            topo_cons: TopoCons::default(),
        };
        Self {
            graphs: vec![main],
            tensors: HashMap::new(),
            ops: Vec::new(),
            subgraph_counters: HashMap::new(),
            tensor_counters: HashMap::new(),
            debug_infos: Vec::new(),
        }
    }

    pub(crate) fn graph(&self, id: GraphId) -> &GraphData {
        &self.graphs[id.0]
    }

    pub(crate) fn graph_mut(&mut self, id: GraphId) -> &mut GraphData {
        &mut self.graphs[id.0]
    }

    pub(crate) fn op(&self, id: OpId) -> &OpData {
        &self.ops[id.0]
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut OpData {
        &mut self.ops[id.0]
    }

    pub(crate) fn tensor(&self, id: &str) -> Option<&TensorData> {
        self.tensors.get(id)
    }

    /// Add a tensor record to `graph`. The id must be unused.
    pub(crate) fn add_tensor(
        &mut self,
        graph: GraphId,
        id: String,
        info: TensorInfo,
        tensor_type: TensorType,
        data: Option<HostArray>,
    ) {
        self.graph_mut(graph).tensors.push(id.clone());
        self.tensors.insert(
            id,
            TensorData {
                graph,
                info,
                tensor_type,
                data,
                producer: None,
                consumers: Vec::new(),
            },
        );
    }

    /// Return `base` if unused, otherwise the first free `base_<n>`.
    pub(crate) fn unique_tensor_id(&mut self, base: String) -> String {
        if !self.tensors.contains_key(&base) {
            return base;
        }
        let counter = self.tensor_counters.entry(base.clone()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}_{}", base, counter);
            if !self.tensors.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

struct IrInner {
    id: u64,
    options: IrOptions,
    store: RefCell<IrStore>,
    tensor_cache: RefCell<HashMap<String, Rc<TensorState>>>,
}

/// The intermediate representation: a main graph plus any number of subgraphs.
///
/// `Ir` is a cheap shared handle. Two handles are equal when they refer to the
/// same IR.
#[derive(Clone)]
pub struct Ir {
    inner: Rc<IrInner>,
}

impl Ir {
    /// Create a new IR with default options and an empty main graph.
    pub fn new() -> Self {
        Self::with_options(IrOptions::default())
    }

    pub fn with_options(options: IrOptions) -> Self {
        let id = NEXT_IR_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("Created Ir[id={}] with {:?}", id, options);
        Self {
            inner: Rc::new(IrInner {
                id,
                options,
                store: RefCell::new(IrStore::new()),
                tensor_cache: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> &IrOptions {
        &self.inner.options
    }

    /// The main graph every IR is created with.
    pub fn main_graph(&self) -> Graph {
        Graph::from_raw(self.clone(), GraphId::MAIN)
    }

    /// Look up a graph by id.
    pub fn graph(&self, id: GraphId) -> Option<Graph> {
        (id.0 < self.store().graphs.len()).then(|| Graph::from_raw(self.clone(), id))
    }

    /// All graphs, main graph first.
    pub fn graphs(&self) -> Vec<Graph> {
        let count = self.store().graphs.len();
        (0..count).map(|i| Graph::from_raw(self.clone(), GraphId(i))).collect()
    }

    /// Create a new, empty subgraph. The name defaults to `graph` and is made unique.
    pub fn create_empty_graph(&self, name: Option<&str>) -> Graph {
        let id = self.unique_subgraph_id(name.unwrap_or("graph"));
        self.add_graph(id)
    }

    /// Make `name` unique among the subgraph ids of this IR: `name_0`, `name_1`, ...
    pub fn unique_subgraph_id(&self, name: &str) -> String {
        let mut store = self.store_mut();
        loop {
            let counter = store.subgraph_counters.entry(name.to_string()).or_insert(0);
            let candidate = format!("{}_{}", name, counter);
            *counter += 1;
            if !store.graphs.iter().any(|g| g.scope == candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn add_graph(&self, scope: String) -> Graph {
        let id = {
            let mut store = self.store_mut();
            let id = GraphId(store.graphs.len());
            store.graphs.push(GraphData {
                name: scope.clone(),
                scope,
                inputs: Vec::new(),
                outputs: Vec::new(),
                by_ref_inputs: HashSet::new(),
                tensors: Vec::new(),
                ops: Vec::new(),
                topo_cons: TopoCons::default(),
            });
            id
        };
        let graph = Graph::from_raw(self.clone(), id);
        log::debug!("Ir[id={}]: created graph {}", self.id(), graph.name());
        graph
    }

    /// Debug info recorded by an op debug context.
    pub fn debug_info(&self, id: DebugInfoId) -> Option<DebugInfo> {
        self.store().debug_infos.get(id.0).cloned()
    }

    /// Total number of operations across all graphs.
    pub fn op_count(&self) -> usize {
        self.store().ops.len()
    }

    pub(crate) fn store(&self) -> Ref<'_, IrStore> {
        self.inner.store.borrow()
    }

    pub(crate) fn store_mut(&self) -> RefMut<'_, IrStore> {
        self.inner.store.borrow_mut()
    }

    pub(crate) fn tensor_cache(&self) -> RefMut<'_, HashMap<String, Rc<TensorState>>> {
        self.inner.tensor_cache.borrow_mut()
    }

    pub(crate) fn tensor_data<R>(&self, id: &str, f: impl FnOnce(&TensorData) -> R) -> GraphResult<R> {
        let store = self.store();
        store
            .tensor(id)
            .map(f)
            .ok_or_else(|| GraphError::TensorNotFound {
                id: id.to_string(),
                ir: self.id(),
            })
    }
}

impl Default for Ir {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Ir {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Ir {}

impl Hash for Ir {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Ir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ir[id={}]", self.id())
    }
}
