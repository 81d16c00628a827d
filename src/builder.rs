// This module turns Rust closures into subgraphs and creates the tensors a graph starts from.
// Ir::create_graph names the new graph after the closure's type path (closure markers and the
// crate name stripped, `::` replaced by `.`), made unique per Ir with a `_N` suffix. It enters
// the graph, declares one subgraph input per tensor argument named after the argument's
// scope-stripped name, runs the closure on the substituted Args and marks whatever it returns
// as the graph outputs, in order. The graph is left again on every exit path. The free
// functions create variables (main graph only), constants and graph inputs in the current
// graph and mark graph outputs. Host data given without a dtype has its 64-bit element types
// narrowed to 32 bits unless IrOptions::downcast_host_data is off.

//! Graph definition from closures, and tensor creation.

use std::fmt;

use crate::context;
use crate::core::{
    Constant, DType, Graph, GraphError, GraphResult, HostArray, Ir, ReplicaGrouping, Tensor,
    TensorInfo, TensorSpec, TensorType, Variable,
};
use crate::ops::CallOutputs;

/// One argument of a graph function.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Declares a subgraph input like the tensor.
    Tensor(Tensor),
    /// Declares a subgraph input like the tensor, passed by reference.
    TensorByRef(Tensor),
    /// Declares a subgraph input from a spec.
    Spec { spec: TensorSpec, name: String },
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Arg {
    pub fn by_ref(t: &Tensor) -> Self {
        Arg::TensorByRef(t.clone())
    }

    pub fn spec(spec: TensorSpec, name: &str) -> Self {
        Arg::Spec {
            spec,
            name: name.to_string(),
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Arg::Tensor(t) | Arg::TensorByRef(t) => Some(t),
            _ => None,
        }
    }

    fn substitute(self, graph: &Graph) -> GraphResult<Arg> {
        match self {
            Arg::Tensor(t) => graph.add_input(&t.name(), t.info(), false).map(Arg::Tensor),
            Arg::TensorByRef(t) => graph
                .add_input(&t.name(), t.info(), true)
                .map(Arg::TensorByRef),
            Arg::Spec { spec, name } => graph.add_input(&name, spec.info(), false).map(Arg::Tensor),
            other => Ok(other),
        }
    }
}

impl From<Tensor> for Arg {
    fn from(t: Tensor) -> Self {
        Arg::Tensor(t)
    }
}

impl From<&Tensor> for Arg {
    fn from(t: &Tensor) -> Self {
        Arg::Tensor(t.clone())
    }
}

impl From<&Variable> for Arg {
    fn from(v: &Variable) -> Self {
        Arg::Tensor(v.tensor().clone())
    }
}

impl From<TensorSpec> for Arg {
    fn from(spec: TensorSpec) -> Self {
        Arg::Spec {
            spec,
            name: "t".to_string(),
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

/// Positional and keyword arguments of a graph function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    positional: Vec<Arg>,
    keyword: Vec<(String, Arg)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional tensor arguments, in order.
    pub fn from_tensors(tensors: &[&Tensor]) -> Self {
        Self {
            positional: tensors.iter().map(|t| Arg::Tensor((*t).clone())).collect(),
            keyword: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.positional.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: &str, arg: impl Into<Arg>) -> Self {
        self.keyword.push((name.to_string(), arg.into()));
        self
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.positional.get(index)
    }

    pub fn get_kw(&self, name: &str) -> Option<&Arg> {
        self.keyword.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Positional argument `index`, which must be a tensor.
    pub fn tensor(&self, index: usize) -> GraphResult<&Tensor> {
        self.get(index)
            .and_then(Arg::as_tensor)
            .ok_or_else(|| GraphError::InvalidAttribute {
                op: "graph function",
                reason: format!("positional argument {} is not a tensor", index),
            })
    }

    /// Keyword argument `name`, which must be a tensor.
    pub fn tensor_kw(&self, name: &str) -> GraphResult<&Tensor> {
        self.get_kw(name)
            .and_then(Arg::as_tensor)
            .ok_or_else(|| GraphError::InvalidAttribute {
                op: "graph function",
                reason: format!("keyword argument {} is not a tensor", name),
            })
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn substitute(self, graph: &Graph) -> GraphResult<Args> {
        let positional = self
            .positional
            .into_iter()
            .map(|a| a.substitute(graph))
            .collect::<GraphResult<Vec<_>>>()?;
        let keyword = self
            .keyword
            .into_iter()
            .map(|(n, a)| a.substitute(graph).map(|a| (n, a)))
            .collect::<GraphResult<Vec<_>>>()?;
        Ok(Args { positional, keyword })
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} positional, {} keyword", self.positional.len(), self.keyword.len())
    }
}

/// Values a graph function may return; each tensor becomes a graph output.
pub trait IntoGraphOutputs {
    fn into_graph_outputs(self) -> Vec<Tensor>;
}

impl IntoGraphOutputs for () {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        Vec::new()
    }
}

impl IntoGraphOutputs for Tensor {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        vec![self]
    }
}

impl IntoGraphOutputs for Vec<Tensor> {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        self
    }
}

impl IntoGraphOutputs for Option<Tensor> {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        self.into_iter().collect()
    }
}

impl IntoGraphOutputs for (Tensor, Tensor) {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        vec![self.0, self.1]
    }
}

impl IntoGraphOutputs for (Tensor, Tensor, Tensor) {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        vec![self.0, self.1, self.2]
    }
}

impl IntoGraphOutputs for CallOutputs {
    fn into_graph_outputs(self) -> Vec<Tensor> {
        self.into_vec()
    }
}

/// Dotted path of a function type, without closure markers, generic arguments
/// and crate name.
pub(crate) fn graph_function_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let mut path = String::with_capacity(full.len());
    let mut depth = 0usize;
    for c in full.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 => path.push(c),
            _ => {}
        }
    }
    let mut parts: Vec<&str> = path
        .split("::")
        .filter(|part| !part.is_empty() && !part.starts_with("{{closure"))
        .collect();
    // `<T as Trait>::f` has no leading crate segment once the brackets are gone.
    if !full.starts_with('<') && !parts.is_empty() {
        parts.remove(0);
    }
    parts.join(".")
}

impl Ir {
    /// Define a subgraph by running `f` on `args` inside it.
    ///
    /// The graph is named after `f`'s path, e.g. `model.Block.forward_0`.
    pub fn create_graph<F, O>(&self, f: F, args: Args) -> GraphResult<Graph>
    where
        F: FnOnce(&Args) -> GraphResult<O>,
        O: IntoGraphOutputs,
    {
        let name = graph_function_name::<F>();
        if name.is_empty() {
            return Err(GraphError::UnnamedGraphFunction);
        }
        self.build_graph(&name, f, args)
    }

    /// Like [`Ir::create_graph`] with an explicit base name.
    pub fn create_graph_named<F, O>(&self, name: &str, f: F, args: Args) -> GraphResult<Graph>
    where
        F: FnOnce(&Args) -> GraphResult<O>,
        O: IntoGraphOutputs,
    {
        if name.is_empty() {
            return Err(GraphError::UnnamedGraphFunction);
        }
        self.build_graph(name, f, args)
    }

    fn build_graph<F, O>(&self, name: &str, f: F, args: Args) -> GraphResult<Graph>
    where
        F: FnOnce(&Args) -> GraphResult<O>,
        O: IntoGraphOutputs,
    {
        let graph = self.create_empty_graph(Some(name));
        log::debug!("Defining graph {} from {}", graph.name(), args);
        graph.within(|| {
            let args = args.substitute(&graph)?;
            for output in f(&args)?.into_graph_outputs() {
                graph.mark_output(&output)?;
            }
            Ok(())
        })?;
        log::debug!(
            "Defined graph {} with {} inputs and {} outputs",
            graph.name(),
            graph.input_ids().len(),
            graph.output_ids().len()
        );
        Ok(graph)
    }
}

fn prepare_host_data(
    ir: &Ir,
    data: HostArray,
    dtype: Option<DType>,
) -> GraphResult<(HostArray, DType)> {
    match dtype {
        Some(dtype) => Ok((data.cast(dtype.as_host()?), dtype)),
        None => {
            let data = if ir.options().downcast_host_data {
                data.downcast()
            } else {
                data
            };
            let dtype = DType::as_dtype(&data)?;
            Ok((data, dtype))
        }
    }
}

fn add_host_tensor(
    graph: &Graph,
    data: HostArray,
    dtype: Option<DType>,
    name: Option<&str>,
    tensor_type: TensorType,
) -> GraphResult<Tensor> {
    let (data, dtype) = prepare_host_data(graph.ir(), data, dtype)?;
    let info = TensorInfo::new(dtype, data.shape().to_vec());
    graph.add_tensor(name, info, tensor_type, Some(data))
}

/// Create a variable in the main graph.
///
/// Fails with [`GraphError::VariableOutsideMainGraph`] inside a subgraph.
pub fn variable(
    data: impl Into<HostArray>,
    dtype: Option<DType>,
    name: Option<&str>,
) -> GraphResult<Variable> {
    let graph = context::current_graph()?;
    if !graph.is_main() {
        return Err(GraphError::VariableOutsideMainGraph);
    }
    let tensor = add_host_tensor(&graph, data.into(), dtype, name, TensorType::Variable)?;
    tensor
        .as_variable()
        .ok_or_else(|| GraphError::TensorNotFound {
            id: tensor.id().to_string(),
            ir: graph.ir().id(),
        })
}

/// Create a variable shared according to `grouping`.
pub fn variable_with_grouping(
    data: impl Into<HostArray>,
    dtype: Option<DType>,
    name: Option<&str>,
    grouping: ReplicaGrouping,
) -> GraphResult<Variable> {
    let var = variable(data, dtype, name)?;
    var.set_replica_grouping(grouping);
    Ok(var)
}

/// Create a constant in the current graph.
pub fn constant(
    data: impl Into<HostArray>,
    dtype: Option<DType>,
    name: Option<&str>,
) -> GraphResult<Constant> {
    let graph = context::current_graph()?;
    let tensor = add_host_tensor(&graph, data.into(), dtype, name, TensorType::Const)?;
    tensor
        .as_constant()
        .ok_or_else(|| GraphError::TensorNotFound {
            id: tensor.id().to_string(),
            ir: graph.ir().id(),
        })
}

/// Declare an input of the current graph.
pub fn graph_input(shape: &[usize], dtype: DType, name: &str) -> GraphResult<Tensor> {
    graph_input_with(&TensorSpec::new(shape.to_vec(), dtype), name, false)
}

/// Declare an input of the current graph from a spec, optionally by reference.
pub fn graph_input_with(spec: &TensorSpec, name: &str, by_ref: bool) -> GraphResult<Tensor> {
    let graph = context::current_graph()?;
    graph.add_input(name, spec.info(), by_ref)
}

/// Mark `t` as the next output of the current graph.
pub fn graph_output(t: &Tensor) -> GraphResult<()> {
    context::current_graph()?.mark_output(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::reset_context;
    use crate::core::{HostType, IrOptions, TensorKind};

    mod model {
        pub struct Block;

        impl Block {
            pub fn forward(
                args: &super::Args,
            ) -> crate::core::GraphResult<crate::core::Tensor> {
                args.tensor(0).cloned()
            }
        }
    }

    #[test]
    fn test_graph_function_name() {
        fn name_of<F>(_: &F) -> String {
            graph_function_name::<F>()
        }
        fn local(_: &Args) -> GraphResult<()> {
            Ok(())
        }
        assert_eq!(
            name_of(&local),
            "builder.tests.test_graph_function_name.local"
        );
        let closure = |_: &Args| -> GraphResult<()> { Ok(()) };
        assert_eq!(name_of(&closure), "builder.tests.test_graph_function_name");

        fn generic<T: Clone>(_: &Args) -> GraphResult<()> {
            Ok(())
        }
        assert_eq!(
            name_of(&generic::<Vec<Tensor>>),
            "builder.tests.test_graph_function_name.generic"
        );
    }

    #[test]
    fn test_create_graph_names_are_unique() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        let g0 = ir
            .create_graph(model::Block::forward, Args::from_tensors(&[&x]))
            .unwrap();
        let g1 = ir
            .create_graph(model::Block::forward, Args::from_tensors(&[&x]))
            .unwrap();
        assert_eq!(g0.name(), "builder.tests.model.Block.forward_0");
        assert_eq!(g1.name(), "builder.tests.model.Block.forward_1");
        assert_eq!(g0.input_ids(), vec!["builder.tests.model.Block.forward_0/x"]);
        assert_eq!(g0.outputs(), g0.inputs());
    }

    #[test]
    fn test_graph_left_on_error() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let res = ir.create_graph_named(
            "bad",
            |_: &Args| -> GraphResult<()> { Err(GraphError::ScalarLength) },
            Args::new(),
        );
        assert_eq!(res.unwrap_err(), GraphError::ScalarLength);
        assert_eq!(context::current_graph().unwrap(), ir.main_graph());
    }

    #[test]
    fn test_variable_only_in_main_graph() {
        reset_context();
        let ir = Ir::new();
        let sub = ir.create_empty_graph(None);
        let _g = sub.enter().unwrap();
        assert_eq!(
            variable(1.0f32, None, None).unwrap_err(),
            GraphError::VariableOutsideMainGraph
        );
        assert!(constant(1.0f32, None, None).is_ok());
    }

    #[test]
    fn test_host_data_downcast() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let v = variable(vec![1i64, 2, 3], None, Some("v")).unwrap();
        assert_eq!(v.dtype(), DType::Int32);
        assert_eq!(v.host_data().unwrap().host_type(), HostType::I32);
        let c = constant(2.5f64, Some(DType::Float16), None).unwrap();
        assert_eq!(c.dtype(), DType::Float16);
        assert_eq!(c.kind(), TensorKind::Constant);

        reset_context();
        let ir = Ir::with_options(IrOptions::default().with_downcast_host_data(false));
        let _g = ir.main_graph().enter().unwrap();
        let v = variable(vec![1.0f64], None, None).unwrap();
        assert_eq!(v.dtype(), DType::Float64);
    }

    #[test]
    fn test_float8_has_no_host_data() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        assert_eq!(
            constant(1.0f32, Some(DType::Float8E4M3), None).unwrap_err(),
            GraphError::NoHostType { dtype: "float8_e4m3" }
        );
    }

    #[test]
    fn test_graph_output_membership() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        let sub = ir.create_empty_graph(None);
        let err = sub.within(|| graph_output(&x)).unwrap_err();
        assert!(matches!(err, GraphError::TensorNotInGraph { .. }));
    }
}
