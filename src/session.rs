// This module lowers finished graphs into the read-only program description handed to the
// external graph compiler. ExportSession owns nothing but a borrowed bumpalo arena: every
// description (program, graphs, tensors, ops, attribute lists) is allocated there and shares
// the session lifetime, and tensor ids, op names and type names are interned so repeated
// strings are stored once. Exporting a graph lowers it first and then, breadth-first, every
// graph reached through a call op, so a callee appears exactly once no matter how often it is
// called and a call's attribute refers to the callee by its position in the program. Ops are
// emitted in schedule order (data edges plus topological constraints) and constraints are
// rewritten to schedule positions. SessionStats counts what was exported and prints the most
// frequent op types. GraphCompiler is the seam to the compiler collaborator.

//! Arena-backed export of graphs for the external compiler.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::{
    DType, Graph, GraphError, GraphId, GraphResult, InitType, Ir, Op, OpId, OpKind, Tensor,
    TensorType,
};

/// Value of an op attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrValue<'arena> {
    Int(i64),
    Float(f64),
    Ints(&'arena [i64]),
    DType(DType),
    Str(&'arena str),
    /// Position of a graph in [`ProgramDesc::graphs`].
    Graph(usize),
}

/// Exported tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorDesc<'arena> {
    pub id: &'arena str,
    pub dtype: DType,
    pub shape: &'arena [usize],
    pub meta_shape: &'arena [usize],
    pub tensor_type: TensorType,
    /// Little-endian host bytes of variables and constants.
    pub data: Option<&'arena [u8]>,
}

/// Exported op.
#[derive(Debug, Clone, Copy)]
pub struct OpDesc<'arena> {
    pub name: &'arena str,
    pub op_type: &'arena str,
    pub attributes: &'arena [(&'arena str, AttrValue<'arena>)],
    pub inputs: &'arena [&'arena str],
    pub outputs: &'arena [&'arena str],
    pub modified_inputs: &'arena [usize],
    pub virtual_graph_id: Option<i64>,
    pub pipeline_stage: Option<i64>,
}

impl<'arena> OpDesc<'arena> {
    pub fn attribute(&self, name: &str) -> Option<AttrValue<'arena>> {
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

/// Ordering constraint between two ops of a graph, as schedule positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintDesc {
    pub before: usize,
    pub after: usize,
    pub tied: bool,
}

/// Exported graph. Ops are in schedule order.
#[derive(Debug, Clone, Copy)]
pub struct GraphDesc<'arena> {
    pub name: &'arena str,
    pub inputs: &'arena [&'arena str],
    pub outputs: &'arena [&'arena str],
    pub tensors: &'arena [TensorDesc<'arena>],
    pub ops: &'arena [OpDesc<'arena>],
    pub constraints: &'arena [ConstraintDesc],
}

impl<'arena> GraphDesc<'arena> {
    pub fn tensor(&self, id: &str) -> Option<&TensorDesc<'arena>> {
        self.tensors.iter().find(|t| t.id == id)
    }
}

/// Exported program: the entry graph first, then every graph it reaches through calls.
#[derive(Debug, Clone, Copy)]
pub struct ProgramDesc<'arena> {
    pub ir_id: u64,
    pub replication_factor: u32,
    pub graphs: &'arena [GraphDesc<'arena>],
}

impl<'arena> ProgramDesc<'arena> {
    pub fn entry(&self) -> Option<&GraphDesc<'arena>> {
        self.graphs.first()
    }

    pub fn graph(&self, name: &str) -> Option<&GraphDesc<'arena>> {
        self.graphs.iter().find(|g| g.name == name)
    }
}

impl fmt::Display for ProgramDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program Ir[id={}] (replication factor {})",
            self.ir_id, self.replication_factor
        )?;
        for graph in self.graphs {
            writeln!(
                f,
                "graph {}({}) -> ({})",
                graph.name,
                graph.inputs.join(", "),
                graph.outputs.join(", ")
            )?;
            for (pos, op) in graph.ops.iter().enumerate() {
                writeln!(
                    f,
                    "  {:>3}: {} = {}[{}]({})",
                    pos,
                    op.outputs.join(", "),
                    op.op_type,
                    op.name,
                    op.inputs.join(", ")
                )?;
            }
            for c in graph.constraints {
                writeln!(f, "  {} -> {}{}", c.before, c.after, if c.tied { " (tied)" } else { "" })?;
            }
        }
        Ok(())
    }
}

/// The external graph compiler.
pub trait GraphCompiler {
    type Executable;
    type Error: std::error::Error;

    fn compile(&mut self, program: &ProgramDesc<'_>) -> Result<Self::Executable, Self::Error>;
}

/// Arena-backed export session.
pub struct ExportSession<'arena> {
    arena: &'arena Bump,
    interned_strings: RefCell<HashMap<String, &'arena str>>,
    stats: RefCell<SessionStats>,
}

impl<'arena> ExportSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            interned_strings: RefCell::new(HashMap::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(slice)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }
        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Lower `graph` and every graph it calls.
    pub fn export(&self, graph: &Graph) -> GraphResult<&'arena ProgramDesc<'arena>> {
        let ir = graph.ir();
        log::debug!("Exporting graph {} of Ir[id={}]", graph.name(), ir.id());

        let mut positions: HashMap<GraphId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        positions.insert(graph.id(), 0);
        queue.push_back(graph.clone());

        let mut graphs = BumpVec::new_in(self.arena);
        while let Some(next) = queue.pop_front() {
            let desc = self.lower_graph(ir, &next, &mut positions, &mut queue)?;
            graphs.push(desc);
        }

        let program = self.alloc(ProgramDesc {
            ir_id: ir.id(),
            replication_factor: ir.options().replication_factor,
            graphs: graphs.into_bump_slice(),
        });
        log::debug!(
            "Exported {} graphs for Ir[id={}]",
            program.graphs.len(),
            ir.id()
        );
        Ok(program)
    }

    fn lower_graph(
        &self,
        ir: &Ir,
        graph: &Graph,
        positions: &mut HashMap<GraphId, usize>,
        queue: &mut VecDeque<Graph>,
    ) -> GraphResult<GraphDesc<'arena>> {
        let schedule = graph.op_schedule();
        let slots: HashMap<OpId, usize> = schedule
            .iter()
            .enumerate()
            .map(|(pos, op)| (op.id(), pos))
            .collect();

        let tensors = graph.tensors();
        let mut tensor_descs = BumpVec::with_capacity_in(tensors.len(), self.arena);
        for t in &tensors {
            tensor_descs.push(self.lower_tensor(t));
        }

        let mut op_descs = BumpVec::with_capacity_in(schedule.len(), self.arena);
        for op in &schedule {
            op_descs.push(self.lower_op(ir, op, positions, queue)?);
        }

        let mut constraints = BumpVec::new_in(self.arena);
        for con in graph.topo_cons().iter() {
            match (slots.get(&con.before), slots.get(&con.after)) {
                (Some(&before), Some(&after)) => constraints.push(ConstraintDesc {
                    before,
                    after,
                    tied: con.tied,
                }),
                _ => log::warn!(
                    "Graph {}: dropping constraint on an op outside the graph",
                    graph.name()
                ),
            }
        }

        let desc = GraphDesc {
            name: self.intern_str(&graph.name()),
            inputs: self.intern_all(graph.input_ids().iter().map(String::as_str)),
            outputs: self.intern_all(graph.output_ids().iter().map(String::as_str)),
            tensors: tensor_descs.into_bump_slice(),
            ops: op_descs.into_bump_slice(),
            constraints: constraints.into_bump_slice(),
        };

        let mut stats = self.stats.borrow_mut();
        stats.graphs_exported += 1;
        stats.tensors_exported += desc.tensors.len();
        stats.constraints_exported += desc.constraints.len();
        if desc.ops.len() > stats.largest_graph_size || stats.largest_graph_name.is_empty() {
            stats.largest_graph_size = desc.ops.len();
            stats.largest_graph_name = desc.name.to_string();
        }
        Ok(desc)
    }

    fn lower_tensor(&self, t: &Tensor) -> TensorDesc<'arena> {
        let info = t.info();
        TensorDesc {
            id: self.intern_str(t.id()),
            dtype: info.dtype(),
            shape: self.alloc_slice(info.shape()),
            meta_shape: self.alloc_slice(info.meta_shape()),
            tensor_type: t.tensor_type(),
            data: t.host_data().map(|d| self.alloc_slice(d.bytes())),
        }
    }

    fn lower_op(
        &self,
        ir: &Ir,
        op: &Op,
        positions: &mut HashMap<GraphId, usize>,
        queue: &mut VecDeque<Graph>,
    ) -> GraphResult<OpDesc<'arena>> {
        let kind = op.kind();
        let mut attributes = BumpVec::new_in(self.arena);
        match &kind {
            OpKind::Init { init } => {
                let value = match init {
                    InitType::Zero => "zero",
                    InitType::NoInit => "none",
                };
                attributes.push((self.intern_str("init"), AttrValue::Str(self.intern_str(value))));
            }
            OpKind::Cast { to } => attributes.push((self.intern_str("to"), AttrValue::DType(*to))),
            OpKind::ScaledAdd { a, b } => {
                attributes.push((self.intern_str("scale0"), AttrValue::Float(*a)));
                attributes.push((self.intern_str("scale1"), AttrValue::Float(*b)));
            }
            OpKind::Slice { starts, ends, steps } => {
                attributes.push((self.intern_str("starts"), AttrValue::Ints(self.alloc_slice(starts))));
                attributes.push((self.intern_str("ends"), AttrValue::Ints(self.alloc_slice(ends))));
                attributes.push((self.intern_str("steps"), AttrValue::Ints(self.alloc_slice(steps))));
            }
            OpKind::Subsample { strides } => {
                attributes.push((self.intern_str("strides"), self.ints(strides)));
            }
            OpKind::Squeeze { axes } => attributes.push((self.intern_str("axes"), self.ints(axes))),
            OpKind::Reshape { shape } => {
                attributes.push((self.intern_str("shape"), self.ints(shape)));
            }
            OpKind::Transpose { permutation } => {
                attributes.push((self.intern_str("perm"), self.ints(permutation)));
            }
            OpKind::Gather { axis } => {
                attributes.push((self.intern_str("axis"), AttrValue::Int(*axis as i64)));
            }
            OpKind::Call { callee } => {
                let position = match positions.get(callee) {
                    Some(&p) => p,
                    None => {
                        let graph = ir.graph(*callee).ok_or_else(|| GraphError::Unsupported {
                            component: "ExportSession",
                            op: format!("call to unknown graph #{}", callee.index()),
                        })?;
                        let p = positions.len();
                        positions.insert(*callee, p);
                        queue.push_back(graph);
                        p
                    }
                };
                attributes.push((self.intern_str("callee"), AttrValue::Graph(position)));
            }
            _ => {}
        }

        let settings = op.settings();
        let inputs: Vec<Tensor> = op.inputs();
        let outputs: Vec<Tensor> = op.outputs();
        let desc = OpDesc {
            name: self.intern_str(&settings.name),
            op_type: self.intern_str(kind.op_type()),
            attributes: attributes.into_bump_slice(),
            inputs: self.intern_all(inputs.iter().map(Tensor::id)),
            outputs: self.intern_all(outputs.iter().map(Tensor::id)),
            modified_inputs: self.alloc_slice(&op.modified_inputs()),
            virtual_graph_id: settings.virtual_graph_id,
            pipeline_stage: settings.pipeline_stage,
        };

        let mut stats = self.stats.borrow_mut();
        stats.ops_exported += 1;
        *stats.op_counts.entry(kind.op_type().to_string()).or_insert(0) += 1;
        Ok(desc)
    }

    fn ints(&self, values: &[usize]) -> AttrValue<'arena> {
        let mut out = BumpVec::with_capacity_in(values.len(), self.arena);
        out.extend(values.iter().map(|v| *v as i64));
        AttrValue::Ints(out.into_bump_slice())
    }

    fn intern_all<'s>(&self, strings: impl Iterator<Item = &'s str>) -> &'arena [&'arena str] {
        let mut out = BumpVec::new_in(self.arena);
        out.extend(strings.map(|s| self.intern_str(s)));
        out.into_bump_slice()
    }
}

/// Export session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub graphs_exported: usize,
    pub ops_exported: usize,
    pub tensors_exported: usize,
    pub constraints_exported: usize,
    /// Count of each op type exported.
    pub op_counts: HashMap<String, usize>,
    pub largest_graph_size: usize,
    pub largest_graph_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Export Session Statistics:")?;
        writeln!(f, "  Graphs exported: {}", self.graphs_exported)?;
        writeln!(f, "  Ops exported: {}", self.ops_exported)?;
        writeln!(f, "  Tensors exported: {}", self.tensors_exported)?;
        writeln!(f, "  Constraints exported: {}", self.constraints_exported)?;

        if !self.largest_graph_name.is_empty() {
            writeln!(
                f,
                "  Largest graph: {} ({} ops)",
                self.largest_graph_name, self.largest_graph_size
            )?;
        }

        if !self.op_counts.is_empty() {
            writeln!(f, "  Op breakdown:")?;
            let mut sorted: Vec<_> = self.op_counts.iter().collect();
            sorted.sort_by(|(a_type, a), (b_type, b)| b.cmp(a).then_with(|| a_type.cmp(b_type)));

            for (op_type, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", op_type, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = ExportSession::new(&arena);

        let s1 = session.intern_str("main_graph");
        let s2 = session.intern_str("main_graph");
        let s3 = session.intern_str("graph_0");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = ExportSession::new(&arena);

        let value = session.alloc(42);
        assert_eq!(*value, 42);
        assert_eq!(session.alloc_slice(&[1usize, 2, 3]), &[1, 2, 3]);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = SessionStats {
            graphs_exported: 2,
            ops_exported: 3,
            largest_graph_name: "main_graph".to_string(),
            largest_graph_size: 2,
            ..Default::default()
        };
        stats.op_counts.insert("Add".to_string(), 2);
        stats.op_counts.insert("Call".to_string(), 1);

        let text = stats.to_string();
        assert!(text.starts_with("Export Session Statistics:\n"));
        assert!(text.contains("  Graphs exported: 2\n"));
        assert!(text.contains("  Largest graph: main_graph (2 ops)\n"));
        let add = text.find("    Add: 2").unwrap();
        let call = text.find("    Call: 1").unwrap();
        assert!(add < call);
    }
}
