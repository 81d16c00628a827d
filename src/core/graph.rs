// This module implements Graph, the handle to one dataflow graph of an Ir, and TopoCons, the
// per-graph set of topological constraints (happens-after edges between two ops). Graph owns
// the naming rules: a graph's scope prefixes every tensor id created in it, add_scope and
// remove_scope convert between local names and qualified ids, and create_tensor_id applies the
// active name scopes and makes the id unique within the Ir. All op insertion funnels through
// create_op / create_connected_op, which insert the op into the store and then notify the
// context exactly once, after insertion; validation that can fail runs before insertion so a
// rejected op never fires the notification. op_schedule returns a topological order of the
// graph's ops that honours data dependencies and topological constraints, ties broken by
// creation order.

//! Graphs, naming and topological constraints.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt;
use std::hash::{Hash, Hasher};

use hashbrown::{HashMap, HashSet};

use super::error::{GraphError, GraphResult};
use super::host::HostArray;
use super::ir::{GraphId, Ir, OpData};
use super::op::{Op, OpId, OpKind, OpSettings};
use super::tensor::{Tensor, TensorInfo, TensorType};
use crate::context::{self, ContextGuard};

/// A happens-after edge: `after` must be scheduled after `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopoCon {
    pub before: OpId,
    pub after: OpId,
    pub tied: bool,
}

/// Topological constraints of one graph, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct TopoCons {
    cons: Vec<TopoCon>,
    edges: HashSet<(OpId, OpId)>,
}

impl TopoCons {
    /// Insert `before -> after`. Returns false if the edge already exists.
    pub fn insert(&mut self, before: OpId, after: OpId, tied: bool) -> bool {
        if !self.edges.insert((before, after)) {
            return false;
        }
        self.cons.push(TopoCon { before, after, tied });
        true
    }

    pub fn contains(&self, before: OpId, after: OpId) -> bool {
        self.edges.contains(&(before, after))
    }

    /// Ops that must run before `op`.
    pub fn befores(&self, op: OpId) -> Vec<OpId> {
        self.cons.iter().filter(|c| c.after == op).map(|c| c.before).collect()
    }

    /// Ops that must run after `op`.
    pub fn afters(&self, op: OpId) -> Vec<OpId> {
        self.cons.iter().filter(|c| c.before == op).map(|c| c.after).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopoCon> {
        self.cons.iter()
    }

    pub fn len(&self) -> usize {
        self.cons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cons.is_empty()
    }
}

/// Handle to a graph of an [`Ir`].
#[derive(Clone)]
pub struct Graph {
    ir: Ir,
    id: GraphId,
}

/// Fail with [`GraphError::TensorNotInGraph`] unless `tensor` belongs to `graph`.
pub fn check_in_graph(graph: &Graph, tensor: &Tensor) -> GraphResult<()> {
    if graph.contains(tensor) {
        Ok(())
    } else {
        Err(GraphError::TensorNotInGraph {
            tensor: tensor.id().to_string(),
            graph: graph.name(),
        })
    }
}

impl Graph {
    pub(crate) fn from_raw(ir: Ir, id: GraphId) -> Self {
        Self { ir, id }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    /// Scope prefix of tensor ids in this graph; empty for the main graph.
    pub fn scope(&self) -> String {
        self.ir.store().graph(self.id).scope.clone()
    }

    /// Display name; `main_graph` for the main graph, the scope otherwise.
    pub fn name(&self) -> String {
        self.ir.store().graph(self.id).name.clone()
    }

    pub fn is_main(&self) -> bool {
        self.id == GraphId::MAIN
    }

    pub fn main_graph(&self) -> Graph {
        self.ir.main_graph()
    }

    /// Enter this graph. Ops created while the guard lives are added here.
    pub fn enter(&self) -> GraphResult<ContextGuard> {
        context::enter_graph(self)
    }

    /// Run `f` with this graph entered.
    pub fn within<R>(&self, f: impl FnOnce() -> GraphResult<R>) -> GraphResult<R> {
        let _guard = self.enter()?;
        f()
    }

    pub fn input_ids(&self) -> Vec<String> {
        self.ir.store().graph(self.id).inputs.clone()
    }

    pub fn output_ids(&self) -> Vec<String> {
        self.ir.store().graph(self.id).outputs.clone()
    }

    /// Declared inputs in index order.
    pub fn inputs(&self) -> Vec<Tensor> {
        self.resolve(self.input_ids())
    }

    /// Declared outputs in index order.
    pub fn outputs(&self) -> Vec<Tensor> {
        self.resolve(self.output_ids())
    }

    pub fn input_index(&self, id: &str) -> Option<usize> {
        self.ir.store().graph(self.id).inputs.iter().position(|i| i == id)
    }

    pub fn output_index(&self, id: &str) -> Option<usize> {
        self.ir.store().graph(self.id).outputs.iter().position(|o| o == id)
    }

    pub fn is_by_ref_input(&self, id: &str) -> bool {
        self.ir.store().graph(self.id).by_ref_inputs.contains(id)
    }

    /// Inputs declared by reference, in index order.
    pub fn by_ref_inputs(&self) -> Vec<Tensor> {
        let ids: Vec<String> = {
            let store = self.ir.store();
            let g = store.graph(self.id);
            g.inputs
                .iter()
                .filter(|id| g.by_ref_inputs.contains(*id))
                .cloned()
                .collect()
        };
        self.resolve(ids)
    }

    /// Every tensor owned by this graph, in creation order.
    pub fn tensors(&self) -> Vec<Tensor> {
        self.resolve(self.ir.store().graph(self.id).tensors.clone())
    }

    /// Ops in creation order.
    pub fn ops(&self) -> Vec<Op> {
        self.ir
            .store()
            .graph(self.id)
            .ops
            .iter()
            .map(|op| Op::from_raw(self.ir.clone(), *op))
            .collect()
    }

    pub fn topo_cons(&self) -> TopoCons {
        self.ir.store().graph(self.id).topo_cons.clone()
    }

    /// True if `tensor` is owned by this graph.
    pub fn contains(&self, tensor: &Tensor) -> bool {
        tensor.ir() == &self.ir
            && self
                .ir
                .store()
                .tensor(tensor.id())
                .is_some_and(|t| t.graph == self.id)
    }

    /// Look up a tensor of this graph by fully qualified id.
    pub fn get_tensor(&self, id: &str) -> GraphResult<Tensor> {
        let tensor = Tensor::from_raw(&self.ir, id)?;
        check_in_graph(self, &tensor)?;
        Ok(tensor)
    }

    /// Prefix `name` with this graph's scope.
    pub fn add_scope(&self, name: &str) -> String {
        let scope = self.scope();
        if scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", scope, name)
        }
    }

    /// Strip this graph's scope from `id`.
    pub fn remove_scope(&self, id: &str) -> GraphResult<String> {
        let scope = self.scope();
        if scope.is_empty() {
            return Ok(id.to_string());
        }
        id.strip_prefix(scope.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
            .ok_or_else(|| GraphError::NotInScope {
                id: id.to_string(),
                graph: self.name(),
            })
    }

    /// Ops in an order honouring data edges and topological constraints. Ties
    /// are broken by creation order.
    pub fn op_schedule(&self) -> Vec<Op> {
        let order = {
            let store = self.ir.store();
            let graph = store.graph(self.id);
            let members: BTreeSet<OpId> = graph.ops.iter().copied().collect();

            let mut preds: HashMap<OpId, HashSet<OpId>> = HashMap::new();
            for &op in &graph.ops {
                let entry = preds.entry(op).or_default();
                for input in store.op(op).inputs.values() {
                    if let Some((producer, _)) = store.tensor(input).and_then(|t| t.producer) {
                        if members.contains(&producer) && producer != op {
                            entry.insert(producer);
                        }
                    }
                }
            }
            for con in graph.topo_cons.iter() {
                if members.contains(&con.before) && members.contains(&con.after) {
                    preds.entry(con.after).or_default().insert(con.before);
                }
            }

            let mut succs: HashMap<OpId, Vec<OpId>> = HashMap::new();
            let mut indegree: HashMap<OpId, usize> = HashMap::new();
            for (&op, ps) in &preds {
                indegree.insert(op, ps.len());
                for &p in ps {
                    succs.entry(p).or_default().push(op);
                }
            }

            let mut ready: BinaryHeap<Reverse<OpId>> = indegree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(op, _)| Reverse(*op))
                .collect();
            let mut order = Vec::with_capacity(members.len());
            while let Some(Reverse(op)) = ready.pop() {
                order.push(op);
                for next in succs.get(&op).into_iter().flatten() {
                    if let Some(d) = indegree.get_mut(next) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(Reverse(*next));
                        }
                    }
                }
            }
            if order.len() != members.len() {
                log::warn!(
                    "Graph {}: topological constraints form a cycle, appending the remaining ops in creation order",
                    graph.name
                );
                let scheduled: BTreeSet<OpId> = order.iter().copied().collect();
                order.extend(members.difference(&scheduled).copied());
            }
            order
        };
        order
            .into_iter()
            .map(|op| Op::from_raw(self.ir.clone(), op))
            .collect()
    }

    /// Qualified, unique id for a new tensor named `name` under the active name scopes.
    pub(crate) fn create_tensor_id(&self, name: Option<&str>) -> String {
        let mut parts = context::name_scopes();
        parts.push(name.unwrap_or("t").to_string());
        let scoped = self.add_scope(&parts.join("/"));
        self.ir.store_mut().unique_tensor_id(scoped)
    }

    pub(crate) fn add_tensor(
        &self,
        name: Option<&str>,
        info: TensorInfo,
        tensor_type: TensorType,
        data: Option<HostArray>,
    ) -> GraphResult<Tensor> {
        let id = self.create_tensor_id(name);
        log::trace!("Graph {}: new {:?} tensor {}", self.name(), tensor_type, id);
        self.ir
            .store_mut()
            .add_tensor(self.id, id.clone(), info, tensor_type, data);
        Tensor::from_raw(&self.ir, &id)
    }

    /// Declare a new input at the next input index.
    pub(crate) fn add_input(&self, name: &str, info: TensorInfo, by_ref: bool) -> GraphResult<Tensor> {
        let tensor = self.add_tensor(Some(name), info, TensorType::ActGrad, None)?;
        let mut store = self.ir.store_mut();
        let graph = store.graph_mut(self.id);
        graph.inputs.push(tensor.id().to_string());
        if by_ref {
            graph.by_ref_inputs.insert(tensor.id().to_string());
        }
        Ok(tensor)
    }

    /// Declare `tensor` as the next output.
    pub(crate) fn mark_output(&self, tensor: &Tensor) -> GraphResult<()> {
        check_in_graph(self, tensor)?;
        self.ir
            .store_mut()
            .graph_mut(self.id)
            .outputs
            .push(tensor.id().to_string());
        Ok(())
    }

    /// Insert a bare op and notify the context. Inputs and outputs are connected afterwards.
    pub(crate) fn create_op(&self, kind: OpKind, settings: OpSettings) -> Op {
        let op = self.insert_op(kind, settings);
        context::notify_op_created(&op);
        op
    }

    /// Insert an op with its inputs connected and its outputs created, then
    /// notify the context. Inputs are checked before anything is inserted.
    pub(crate) fn create_connected_op(
        &self,
        kind: OpKind,
        settings: OpSettings,
        inputs: &[&Tensor],
        outputs: &[(&str, TensorInfo)],
    ) -> GraphResult<(Op, Vec<Tensor>)> {
        self.create_modifying_op(kind, settings, inputs, outputs, &[])
    }

    /// [`Graph::create_connected_op`] for ops writing to the inputs at `modified`.
    /// Ops already reading a modified tensor are constrained to run first.
    pub(crate) fn create_modifying_op(
        &self,
        kind: OpKind,
        settings: OpSettings,
        inputs: &[&Tensor],
        outputs: &[(&str, TensorInfo)],
        modified: &[usize],
    ) -> GraphResult<(Op, Vec<Tensor>)> {
        let mut readers = Vec::new();
        for &index in modified {
            let tensor = inputs.get(index).ok_or_else(|| GraphError::InvalidAttribute {
                op: kind.op_type(),
                reason: format!("modified input {} of {} inputs", index, inputs.len()),
            })?;
            readers.extend(tensor.consumers().into_iter().map(|reader| reader.id()));
        }
        for input in inputs {
            check_in_graph(self, input)?;
        }
        let op = self.insert_op(kind, settings);
        for (index, input) in inputs.iter().enumerate() {
            self.attach_input(op.id(), index, input);
        }
        let mut created = Vec::with_capacity(outputs.len());
        for (index, (name, info)) in outputs.iter().enumerate() {
            created.push(self.create_output(op.id(), index, name, info.clone())?);
        }
        for &index in modified {
            self.mark_modified_input(op.id(), index);
        }
        for reader in readers {
            self.insert_topo_con(reader, op.id(), false);
        }
        context::notify_op_created(&op);
        Ok((op, created))
    }

    fn insert_op(&self, kind: OpKind, settings: OpSettings) -> Op {
        let id = {
            let mut store = self.ir.store_mut();
            let id = OpId(store.ops.len());
            store.ops.push(OpData {
                graph: self.id,
                kind,
                settings,
                inputs: Default::default(),
                outputs: Default::default(),
                modified_inputs: Default::default(),
            });
            store.graph_mut(self.id).ops.push(id);
            id
        };
        Op::from_raw(self.ir.clone(), id)
    }

    /// Connect `tensor` at input `index` of `op`, replacing any previous connection.
    pub(crate) fn connect_input(&self, op: OpId, index: usize, tensor: &Tensor) -> GraphResult<()> {
        check_in_graph(self, tensor)?;
        self.attach_input(op, index, tensor);
        Ok(())
    }

    fn attach_input(&self, op: OpId, index: usize, tensor: &Tensor) {
        let mut store = self.ir.store_mut();
        let previous = store.op_mut(op).inputs.insert(index, tensor.id().to_string());
        if let Some(prev) = previous {
            if let Some(t) = store.tensors.get_mut(&prev) {
                t.consumers.retain(|c| *c != (op, index));
            }
        }
        if let Some(t) = store.tensors.get_mut(tensor.id()) {
            t.consumers.push((op, index));
        }
    }

    /// Create a new tensor named `name` and connect it as output `index` of `op`.
    pub(crate) fn create_output(
        &self,
        op: OpId,
        index: usize,
        name: &str,
        info: TensorInfo,
    ) -> GraphResult<Tensor> {
        let tensor = self.add_tensor(Some(name), info, TensorType::ActGrad, None)?;
        let mut store = self.ir.store_mut();
        store.op_mut(op).outputs.insert(index, tensor.id().to_string());
        if let Some(t) = store.tensors.get_mut(tensor.id()) {
            t.producer = Some((op, index));
        }
        Ok(tensor)
    }

    pub(crate) fn mark_modified_input(&self, op: OpId, index: usize) {
        self.ir.store_mut().op_mut(op).modified_inputs.insert(index);
    }

    /// Add the constraint `before -> after`.
    pub(crate) fn insert_topo_con(&self, before: OpId, after: OpId, tied: bool) {
        let inserted = self
            .ir
            .store_mut()
            .graph_mut(self.id)
            .topo_cons
            .insert(before, after, tied);
        if inserted {
            log::trace!("Graph {}: topocon #{} -> #{}", self.name(), before.0, after.0);
        }
    }

    fn resolve(&self, ids: Vec<String>) -> Vec<Tensor> {
        ids.iter()
            .filter_map(|id| match Tensor::from_raw(&self.ir, id) {
                Ok(t) => Some(t),
                Err(err) => {
                    debug_assert!(false, "dangling tensor id {} in graph {}: {}", id, self.name(), err);
                    log::error!("Dangling tensor id {} in graph {}: {}", id, self.name(), err);
                    None
                }
            })
            .collect()
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ir == other.ir
    }
}

impl Eq for Graph {}

impl Hash for Graph {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.ir.hash(state);
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Graph[{} of {:?}]", self.name(), self.ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;

    fn settings(graph: &Graph, name: &str) -> OpSettings {
        OpSettings {
            graph: graph.id(),
            name: name.to_string(),
            virtual_graph_id: None,
            pipeline_stage: None,
            debug_info_id: None,
        }
    }

    #[test]
    fn test_topo_cons_dedup() {
        let mut cons = TopoCons::default();
        assert!(cons.insert(OpId(0), OpId(1), false));
        assert!(!cons.insert(OpId(0), OpId(1), true));
        assert!(cons.insert(OpId(2), OpId(1), false));
        assert_eq!(cons.len(), 2);
        assert_eq!(cons.befores(OpId(1)), vec![OpId(0), OpId(2)]);
        assert_eq!(cons.afters(OpId(0)), vec![OpId(1)]);
    }

    #[test]
    fn test_scope_helpers() {
        let ir = Ir::new();
        let main = ir.main_graph();
        assert_eq!(main.add_scope("x"), "x");
        assert_eq!(main.remove_scope("x").unwrap(), "x");

        let sub = ir.create_empty_graph(Some("sub"));
        assert_eq!(sub.add_scope("x"), "sub_0/x");
        assert_eq!(sub.remove_scope("sub_0/x").unwrap(), "x");
        assert!(matches!(
            sub.remove_scope("other/x"),
            Err(GraphError::NotInScope { .. })
        ));
    }

    #[test]
    fn test_inputs_and_outputs() {
        let ir = Ir::new();
        let g = ir.create_empty_graph(None);
        let info = TensorInfo::new(DType::Float32, vec![2]);
        let a = g.add_input("a", info.clone(), false).unwrap();
        let b = g.add_input("b", info, true).unwrap();
        g.mark_output(&a).unwrap();
        assert_eq!(g.inputs(), vec![a.clone(), b.clone()]);
        assert_eq!(g.input_index(b.id()), Some(1));
        assert_eq!(g.outputs(), vec![a.clone()]);
        assert_eq!(g.by_ref_inputs(), vec![b]);
        assert!(g.contains(&a));
        assert!(!ir.main_graph().contains(&a));
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_mark_output_checks_membership() {
        let ir = Ir::new();
        let g = ir.create_empty_graph(None);
        let info = TensorInfo::new(DType::Float32, vec![2]);
        let x = ir.main_graph().add_input("x", info, false).unwrap();
        assert!(matches!(
            g.mark_output(&x),
            Err(GraphError::TensorNotInGraph { .. })
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dangling tensor id ghost")]
    fn test_dangling_input_id_is_reported() {
        let ir = Ir::new();
        let g = ir.create_empty_graph(None);
        ir.store_mut().graph_mut(g.id()).inputs.push("ghost".to_string());
        let _ = g.inputs();
    }

    #[test]
    fn test_schedule_honours_topo_cons() {
        let ir = Ir::new();
        let g = ir.main_graph();
        let a = g.create_op(OpKind::Relu, settings(&g, "a"));
        let b = g.create_op(OpKind::Relu, settings(&g, "b"));
        let c = g.create_op(OpKind::Relu, settings(&g, "c"));
        g.insert_topo_con(c.id(), a.id(), false);
        let order: Vec<String> = g.op_schedule().iter().map(Op::name).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(b.graph(), g);
    }

    #[test]
    fn test_connected_op_rejects_foreign_input() {
        let ir = Ir::new();
        let g = ir.main_graph();
        let sub = ir.create_empty_graph(None);
        let info = TensorInfo::new(DType::Float32, vec![2]);
        let x = sub.add_input("x", info.clone(), false).unwrap();
        let res = g.create_connected_op(OpKind::Relu, settings(&g, "r"), &[&x], &[("r_out", info)]);
        assert!(matches!(res, Err(GraphError::TensorNotInGraph { .. })));
        assert!(g.ops().is_empty());
    }

    #[test]
    fn test_connected_op_wires_tensors() {
        let ir = Ir::new();
        let g = ir.main_graph();
        let info = TensorInfo::new(DType::Float32, vec![2]);
        let x = g.add_input("x", info.clone(), false).unwrap();
        let (op, outs) = g
            .create_connected_op(OpKind::Relu, settings(&g, "r"), &[&x], &[("r_out", info)])
            .unwrap();
        let out = op.output(0).unwrap();
        assert_eq!(outs, vec![out.clone()]);
        assert_eq!(out.id(), "r_out");
        assert_eq!(out.producer(), Some(op.clone()));
        assert_eq!(x.consumers(), vec![op.clone()]);
        assert_eq!(op.inputs(), vec![x]);
    }
}
