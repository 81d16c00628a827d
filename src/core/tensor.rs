// This module implements the tensor identity model. A Tensor is a handle made of the owning
// Ir and a shared TensorState looked up through the Ir's memo table: the first lookup of a
// tensor id resolves the stored storage kind (variable, constant or activation) to a
// TensorVariant and caches it, later lookups return the same Rc so per-tensor state with no
// store-side representation (the replica grouping of a variable) survives between handles.
// Equality and hashing use only the tensor id and the Ir id. Every other property (dtype,
// shape, producer, host data) is read from the Ir store on demand. Variable and Constant are
// thin typed views that deref to Tensor.

//! Tensors, tensor infos and storage-kind views.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

use super::dtype::{DType, DataType};
use super::error::{GraphError, GraphResult};
use super::graph::Graph;
use super::host::HostArray;
use super::ir::Ir;
use super::op::Op;

/// Element type, shape and meta shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    dtype: DType,
    shape: Vec<usize>,
    meta_shape: Vec<usize>,
}

impl TensorInfo {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            dtype,
            shape,
            meta_shape: Vec::new(),
        }
    }

    pub fn with_meta_shape(mut self, meta_shape: Vec<usize>) -> Self {
        self.meta_shape = meta_shape;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data_type(&self) -> DataType {
        self.dtype.data_type()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn meta_shape(&self) -> &[usize] {
        &self.meta_shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn nelms(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Storage kind recorded in the IR store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorType {
    /// Produced by an op or declared as a graph input.
    ActGrad,
    Variable,
    Const,
}

/// Shape and dtype description used to declare graph inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub meta_shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            meta_shape: Vec::new(),
        }
    }

    pub fn with_meta_shape(mut self, meta_shape: Vec<usize>) -> Self {
        self.meta_shape = meta_shape;
        self
    }

    pub fn info(&self) -> TensorInfo {
        TensorInfo::new(self.dtype, self.shape.clone()).with_meta_shape(self.meta_shape.clone())
    }
}

/// How the replicas of a variable are grouped: `group_size` replicas, `stride` apart,
/// share one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaGrouping {
    pub stride: u32,
    pub group_size: u32,
}

impl ReplicaGrouping {
    pub fn new(stride: u32, group_size: u32) -> Self {
        Self { stride, group_size }
    }

    /// A single group spanning every replica.
    pub fn all(replication_factor: u32) -> Self {
        Self::new(1, replication_factor.max(1))
    }

    pub fn num_groups(&self, replication_factor: u32) -> u32 {
        (replication_factor / self.group_size.max(1)).max(1)
    }
}

impl fmt::Display for ReplicaGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaGrouping(stride={}, group_size={})", self.stride, self.group_size)
    }
}

/// Public view of a tensor's storage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorKind {
    Activation,
    Constant,
    Variable,
}

pub(crate) enum TensorVariant {
    Activation,
    Constant,
    Variable { replica_grouping: RefCell<ReplicaGrouping> },
}

/// Memoized per (Ir, tensor id).
pub(crate) struct TensorState {
    id: String,
    variant: TensorVariant,
}

/// Handle to a tensor of an [`Ir`].
#[derive(Clone)]
pub struct Tensor {
    ir: Ir,
    state: Rc<TensorState>,
}

impl Tensor {
    /// Resolve a stored tensor to its handle, creating and caching the
    /// shared state on first use.
    pub(crate) fn from_raw(ir: &Ir, id: &str) -> GraphResult<Tensor> {
        if let Some(state) = ir.tensor_cache().get(id) {
            return Ok(Tensor {
                ir: ir.clone(),
                state: Rc::clone(state),
            });
        }
        let tensor_type = ir.tensor_data(id, |t| t.tensor_type)?;
        let variant = match tensor_type {
            TensorType::ActGrad => TensorVariant::Activation,
            TensorType::Const => TensorVariant::Constant,
            TensorType::Variable => TensorVariant::Variable {
                replica_grouping: RefCell::new(ReplicaGrouping::all(
                    ir.options().replication_factor,
                )),
            },
        };
        let state = Rc::new(TensorState {
            id: id.to_string(),
            variant,
        });
        ir.tensor_cache().insert(id.to_string(), Rc::clone(&state));
        Ok(Tensor {
            ir: ir.clone(),
            state,
        })
    }

    /// Fully qualified id, `<graph scope>/<name>`.
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// The id with the owning graph's scope stripped.
    pub fn name(&self) -> String {
        let graph = self.graph();
        graph
            .remove_scope(self.id())
            .unwrap_or_else(|_| self.id().to_string())
    }

    /// Scope of the owning graph; empty in the main graph.
    pub fn scope(&self) -> String {
        self.graph().scope()
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    /// The graph this tensor belongs to.
    pub fn graph(&self) -> Graph {
        let id = self.with_data(|t| t.graph);
        Graph::from_raw(self.ir.clone(), id)
    }

    pub fn info(&self) -> TensorInfo {
        self.with_data(|t| t.info.clone())
    }

    pub fn dtype(&self) -> DType {
        self.with_data(|t| t.info.dtype())
    }

    pub fn shape(&self) -> Vec<usize> {
        self.with_data(|t| t.info.shape().to_vec())
    }

    pub fn meta_shape(&self) -> Vec<usize> {
        self.with_data(|t| t.info.meta_shape().to_vec())
    }

    pub fn rank(&self) -> usize {
        self.with_data(|t| t.info.rank())
    }

    pub fn nelms(&self) -> usize {
        self.with_data(|t| t.info.nelms())
    }

    pub fn spec(&self) -> TensorSpec {
        let info = self.info();
        TensorSpec::new(info.shape().to_vec(), info.dtype()).with_meta_shape(info.meta_shape().to_vec())
    }

    /// Size of the first axis.
    pub fn len(&self) -> GraphResult<usize> {
        self.shape().first().copied().ok_or(GraphError::ScalarLength)
    }

    pub fn tensor_type(&self) -> TensorType {
        self.with_data(|t| t.tensor_type)
    }

    pub fn kind(&self) -> TensorKind {
        match self.state.variant {
            TensorVariant::Activation => TensorKind::Activation,
            TensorVariant::Constant => TensorKind::Constant,
            TensorVariant::Variable { .. } => TensorKind::Variable,
        }
    }

    /// Host data of variables and constants.
    pub fn host_data(&self) -> Option<HostArray> {
        self.with_data(|t| t.data.clone())
    }

    /// The op producing this tensor, if any.
    pub fn producer(&self) -> Option<Op> {
        self.with_data(|t| t.producer)
            .map(|(op, _)| Op::from_raw(self.ir.clone(), op))
    }

    /// Ops consuming this tensor, in connection order.
    pub fn consumers(&self) -> Vec<Op> {
        self.with_data(|t| t.consumers.clone())
            .into_iter()
            .map(|(op, _)| Op::from_raw(self.ir.clone(), op))
            .collect()
    }

    /// True when both handles share the memoized state, i.e. they are the same object.
    pub fn same_object(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub fn as_variable(&self) -> Option<Variable> {
        matches!(self.state.variant, TensorVariant::Variable { .. }).then(|| Variable(self.clone()))
    }

    pub fn as_constant(&self) -> Option<Constant> {
        matches!(self.state.variant, TensorVariant::Constant).then(|| Constant(self.clone()))
    }

    fn with_data<R>(&self, f: impl FnOnce(&super::ir::TensorData) -> R) -> R {
        let store = self.ir.store();
        // Tensors are never removed from their Ir, so a handle always resolves.
        match store.tensor(self.id()) {
            Some(data) => f(data),
            None => unreachable!("tensor {} vanished from Ir[id={}]", self.id(), self.ir.id()),
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.ir.id() == other.ir.id()
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
        self.ir.id().hash(state);
    }
}

pub(crate) struct ShapeDisplay<'a>(pub(crate) &'a [usize]);

impl fmt::Display for ShapeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [] => write!(f, "()"),
            [d] => write!(f, "({},)", d),
            dims => {
                write!(f, "(")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", d)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        write!(f, "Tensor[{} {} {}]", self.id(), info.dtype(), ShapeDisplay(info.shape()))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A tensor stored as a variable: host data plus a replica grouping.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Variable(Tensor);

impl Variable {
    pub fn replica_grouping(&self) -> ReplicaGrouping {
        match &self.0.state.variant {
            TensorVariant::Variable { replica_grouping } => *replica_grouping.borrow(),
            _ => ReplicaGrouping::all(self.0.ir.options().replication_factor),
        }
    }

    pub fn set_replica_grouping(&self, grouping: ReplicaGrouping) {
        if let TensorVariant::Variable { replica_grouping } = &self.0.state.variant {
            log::trace!("{}: replica grouping set to {}", self.0.id(), grouping);
            *replica_grouping.borrow_mut() = grouping;
        }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn into_tensor(self) -> Tensor {
        self.0
    }
}

impl Deref for Variable {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.0
    }
}

impl From<Variable> for Tensor {
    fn from(v: Variable) -> Tensor {
        v.0
    }
}

/// A tensor stored as a constant.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Constant(Tensor);

impl Constant {
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn into_tensor(self) -> Tensor {
        self.0
    }
}

impl Deref for Constant {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.0
    }
}

impl From<Constant> for Tensor {
    fn from(c: Constant) -> Tensor {
        c.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::core::ir::{GraphId, IrOptions};

    fn add(ir: &Ir, id: &str, ty: TensorType, shape: Vec<usize>) -> Tensor {
        ir.store_mut().add_tensor(
            GraphId::MAIN,
            id.to_string(),
            TensorInfo::new(DType::Float32, shape),
            ty,
            None,
        );
        Tensor::from_raw(ir, id).unwrap()
    }

    #[test]
    fn test_lookup_is_memoized() {
        let ir = Ir::new();
        let a = add(&ir, "a", TensorType::ActGrad, vec![2]);
        let again = Tensor::from_raw(&ir, "a").unwrap();
        assert!(a.same_object(&again));
        assert_eq!(a, again);
    }

    #[test]
    fn test_identity_is_id_and_ir() {
        let ir1 = Ir::new();
        let ir2 = Ir::new();
        let a1 = add(&ir1, "a", TensorType::ActGrad, vec![2]);
        let b1 = add(&ir1, "b", TensorType::ActGrad, vec![2]);
        let a2 = add(&ir2, "a", TensorType::ActGrad, vec![2]);
        assert_ne!(a1, b1);
        assert_ne!(a1, a2);
        let set: HashSet<Tensor> = [a1.clone(), a1, b1, a2].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_variant_dispatch() {
        let ir = Ir::with_options(IrOptions::default().with_replication_factor(4));
        let v = add(&ir, "v", TensorType::Variable, vec![2]);
        let c = add(&ir, "c", TensorType::Const, vec![2]);
        let t = add(&ir, "t", TensorType::ActGrad, vec![2]);
        assert_eq!(v.kind(), TensorKind::Variable);
        assert_eq!(c.kind(), TensorKind::Constant);
        assert_eq!(t.kind(), TensorKind::Activation);
        assert!(c.as_constant().is_some() && c.as_variable().is_none());
        let var = v.as_variable().unwrap();
        assert_eq!(var.replica_grouping(), ReplicaGrouping::all(4));
    }

    #[test]
    fn test_replica_grouping_survives_relookup() {
        let ir = Ir::new();
        let v = add(&ir, "v", TensorType::Variable, vec![2]);
        v.as_variable()
            .unwrap()
            .set_replica_grouping(ReplicaGrouping::new(2, 1));
        let again = Tensor::from_raw(&ir, "v").unwrap().as_variable().unwrap();
        assert_eq!(again.replica_grouping(), ReplicaGrouping::new(2, 1));
    }

    #[test]
    fn test_len_of_scalar_fails() {
        let ir = Ir::new();
        let s = add(&ir, "s", TensorType::ActGrad, vec![]);
        let m = add(&ir, "m", TensorType::ActGrad, vec![3, 4]);
        assert_eq!(s.len(), Err(GraphError::ScalarLength));
        assert_eq!(m.len(), Ok(3));
    }

    #[test]
    fn test_display() {
        let ir = Ir::new();
        let t = add(&ir, "x", TensorType::ActGrad, vec![3]);
        assert_eq!(t.to_string(), "Tensor[x float32 (3,)]");
        assert_eq!(ShapeDisplay(&[4, 2]).to_string(), "(4, 2)");
        assert_eq!(ShapeDisplay(&[]).to_string(), "()");
    }

    #[test]
    fn test_unknown_id() {
        let ir = Ir::new();
        assert!(matches!(
            Tensor::from_raw(&ir, "nope"),
            Err(GraphError::TensorNotFound { .. })
        ));
    }
}
