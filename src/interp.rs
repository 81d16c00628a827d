// This module is a reference evaluator for graphs on the host. It stands in for the device
// runtime when a test needs to observe values, for example that a call binds its arguments
// in the right order. Graph inputs are supplied positionally and must match the declared
// shapes; variables and constants read their host data. Ops run in schedule order. Every
// value is computed through an f64 view with numpy-style broadcasting and then stored in the
// output tensor's element type, so integer division truncates and float16 rounds the way the
// stored data would. In-place ops without outputs overwrite the value of the tensor they
// modify. Call ops evaluate the called graph recursively with the call inputs in index order
// and copy the final values of by-ref inputs back to the caller.
// Ops outside the supported set fail with GraphError::Unsupported.

//! Host-side reference execution of graphs.

use std::collections::HashMap;

use crate::core::{Graph, GraphError, GraphResult, HostArray, InitType, Op, OpKind, Tensor};
use crate::ops::broadcast_shapes;

/// Evaluates graphs on the host.
#[derive(Debug, Default)]
pub struct HostExecutor {
    ops_executed: usize,
}

impl HostExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ops evaluated so far, including ops of called graphs.
    pub fn ops_executed(&self) -> usize {
        self.ops_executed
    }

    /// Run `graph` with `inputs` bound to its declared inputs, returning its outputs in order.
    pub fn run(&mut self, graph: &Graph, inputs: &[HostArray]) -> GraphResult<Vec<HostArray>> {
        self.evaluate(graph, inputs).map(|(outputs, _)| outputs)
    }

    /// Run `graph`, returning its outputs and the final values of its inputs.
    fn evaluate(
        &mut self,
        graph: &Graph,
        inputs: &[HostArray],
    ) -> GraphResult<(Vec<HostArray>, Vec<HostArray>)> {
        let declared = graph.inputs();
        if declared.len() != inputs.len() {
            return Err(GraphError::InvalidAttribute {
                op: "HostExecutor",
                reason: format!(
                    "graph {} declares {} inputs, {} were supplied",
                    graph.name(),
                    declared.len(),
                    inputs.len()
                ),
            });
        }
        log::debug!("Running graph {} on the host", graph.name());

        let mut values: HashMap<String, HostArray> = HashMap::new();
        for (t, data) in declared.iter().zip(inputs) {
            if t.shape() != data.shape() {
                return Err(GraphError::ShapeMismatch {
                    op: "HostExecutor",
                    reason: format!(
                        "input {} has shape {:?}, supplied data has shape {:?}",
                        t.id(),
                        t.shape(),
                        data.shape()
                    ),
                });
            }
            values.insert(t.id().to_string(), data.cast(t.dtype().as_host()?));
        }
        for t in graph.tensors() {
            if let Some(data) = t.host_data() {
                values.insert(t.id().to_string(), data);
            }
        }

        for op in graph.op_schedule() {
            self.execute(&op, &mut values)?;
        }

        let lookup = |id: String| values.get(&id).cloned().ok_or(GraphError::MissingValue { id });
        let outputs = graph
            .output_ids()
            .into_iter()
            .map(&lookup)
            .collect::<GraphResult<Vec<_>>>()?;
        let finals = graph
            .input_ids()
            .into_iter()
            .map(&lookup)
            .collect::<GraphResult<Vec<_>>>()?;
        Ok((outputs, finals))
    }

    fn execute(&mut self, op: &Op, values: &mut HashMap<String, HostArray>) -> GraphResult<()> {
        log::trace!("Executing {} ({})", op.name(), op.op_type());
        let kind = op.kind();

        if let OpKind::Call { .. } = kind {
            let callee = op.called_graph().ok_or_else(|| unsupported(op))?;
            let args = op
                .inputs()
                .iter()
                .map(|t| values.get(t.id()).cloned().ok_or_else(|| missing(t)))
                .collect::<GraphResult<Vec<_>>>()?;
            let (outputs, finals) = self.evaluate(&callee, &args)?;
            for (t, data) in op.outputs().iter().zip(outputs) {
                values.insert(t.id().to_string(), data);
            }
            // By-ref inputs carry the callee's modifications back to the caller.
            for index in op.modified_inputs() {
                if let (Some(t), Some(data)) = (op.input(index), finals.get(index)) {
                    values.insert(t.id().to_string(), data.clone());
                }
            }
            self.ops_executed += 1;
            return Ok(());
        }

        let inputs = op
            .inputs()
            .iter()
            .map(|t| fetch(values, t))
            .collect::<GraphResult<Vec<_>>>()?;
        let result = match kind {
            OpKind::Init { init } => {
                let out = op.output(0).ok_or_else(|| unsupported(op))?;
                let fill = match init {
                    InitType::Zero | InitType::NoInit => 0.0,
                };
                Value::filled(out.shape(), fill)
            }
            OpKind::Add => elementwise(op, &inputs, 2, |v| v[0] + v[1])?,
            OpKind::Sub => elementwise(op, &inputs, 2, |v| v[0] - v[1])?,
            OpKind::Mul => elementwise(op, &inputs, 2, |v| v[0] * v[1])?,
            OpKind::Div => elementwise(op, &inputs, 2, |v| v[0] / v[1])?,
            OpKind::Fmod => elementwise(op, &inputs, 2, |v| v[0] % v[1])?,
            OpKind::ScaledAdd { a, b } => elementwise(op, &inputs, 2, |v| a * v[0] + b * v[1])?,
            OpKind::Neg => elementwise(op, &inputs, 1, |v| -v[0])?,
            OpKind::Relu => elementwise(op, &inputs, 1, |v| v[0].max(0.0))?,
            OpKind::Cast { .. } | OpKind::Detach => elementwise(op, &inputs, 1, |v| v[0])?,
            OpKind::Where => {
                elementwise(op, &inputs, 3, |v| if v[0] != 0.0 { v[1] } else { v[2] })?
            }
            _ => return Err(unsupported(op)),
        };

        // Ops without outputs write their result into the tensor they modify.
        let out = match op.output(0) {
            Some(out) => out,
            None if op.modified_inputs().contains(&0) => {
                op.input(0).ok_or_else(|| unsupported(op))?
            }
            None => return Err(unsupported(op)),
        };
        let host = out.dtype().as_host()?;
        values.insert(
            out.id().to_string(),
            HostArray::from_f64(host, result.shape, &result.data),
        );
        self.ops_executed += 1;
        Ok(())
    }
}

/// Dense f64 view of a tensor value.
#[derive(Debug, Clone)]
struct Value {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Value {
    fn filled(shape: Vec<usize>, fill: f64) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![fill; n],
        }
    }
}

fn fetch(values: &HashMap<String, HostArray>, t: &Tensor) -> GraphResult<Value> {
    let array = values.get(t.id()).ok_or_else(|| missing(t))?;
    Ok(Value {
        shape: array.shape().to_vec(),
        data: array.to_f64_vec()?,
    })
}

fn missing(t: &Tensor) -> GraphError {
    GraphError::MissingValue {
        id: t.id().to_string(),
    }
}

fn unsupported(op: &Op) -> GraphError {
    GraphError::Unsupported {
        component: "HostExecutor",
        op: op.op_type().to_string(),
    }
}

/// Apply `f` to `arity` inputs broadcast against each other.
fn elementwise(
    op: &Op,
    inputs: &[Value],
    arity: usize,
    f: impl Fn(&[f64]) -> f64,
) -> GraphResult<Value> {
    if inputs.len() != arity {
        return Err(unsupported(op));
    }
    let mut shape: Vec<usize> = Vec::new();
    for input in inputs {
        shape = broadcast_shapes(op.op_type(), &shape, &input.shape)?;
    }
    let n: usize = shape.iter().product();
    let mut data = Vec::with_capacity(n);
    let mut index = vec![0usize; shape.len()];
    let mut args = vec![0.0; arity];
    for _ in 0..n {
        for (arg, input) in args.iter_mut().zip(inputs) {
            *arg = input.data[offset(&input.shape, &index)];
        }
        data.push(f(&args));
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(Value { shape, data })
}

/// Row-major offset into `shape` of a broadcast index, aligned to the trailing axes.
fn offset(shape: &[usize], index: &[usize]) -> usize {
    let skip = index.len() - shape.len();
    shape
        .iter()
        .zip(&index[skip..])
        .fold(0, |acc, (dim, i)| acc * dim + if *dim == 1 { 0 } else { *i })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{constant, graph_input, graph_output, variable};
    use crate::context::reset_context;
    use crate::core::{DType, Ir};

    #[test]
    fn test_offset_broadcasts_size_one_axes() {
        assert_eq!(offset(&[3, 1], &[2, 1]), 2);
        assert_eq!(offset(&[2], &[1, 1]), 1);
        assert_eq!(offset(&[], &[4, 5]), 0);
    }

    #[test]
    fn test_arithmetic_with_broadcasting() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        let x = graph_input(&[2, 2], DType::Float32, "x").unwrap();
        let w = variable(vec![10.0f32, 20.0], None, Some("w")).unwrap();
        let y = (&x * &*w).unwrap();
        let z = (&y - 1.0f32).unwrap();
        graph_output(&z).unwrap();

        let mut exec = HostExecutor::new();
        let input = HostArray::new(vec![1.0f32, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let out = exec.run(&main, &[input]).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![9.0, 39.0, 29.0, 79.0]);
        assert_eq!(exec.ops_executed(), 2);
    }

    #[test]
    fn test_integer_division_truncates() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        let a = constant(vec![7i32, -7], None, None).unwrap();
        let q = (&*a / 2i32).unwrap();
        graph_output(&q).unwrap();
        let out = HostExecutor::new().run(&main, &[]).unwrap();
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![3.0, -3.0]);
    }

    #[test]
    fn test_tensor_marked_as_output_twice() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        let y = (&x + 1.0f32).unwrap();
        graph_output(&y).unwrap();
        graph_output(&y).unwrap();
        graph_output(&x).unwrap();
        graph_output(&x).unwrap();

        let input = HostArray::from(vec![1.0f32, 2.0]);
        let out = HostExecutor::new().run(&main, &[input]).unwrap();
        let values: Vec<Vec<f64>> = out.iter().map(|o| o.to_f64_vec().unwrap()).collect();
        assert_eq!(
            values,
            vec![vec![2.0, 3.0], vec![2.0, 3.0], vec![1.0, 2.0], vec![1.0, 2.0]]
        );
    }

    #[test]
    fn test_inplace_ops_overwrite_their_target() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        // Reads `x` before it is modified.
        let before = x.neg().unwrap();
        x.relu_().unwrap();
        x.add_(3.0f32).unwrap();
        graph_output(&before).unwrap();
        graph_output(&x).unwrap();

        let input = HostArray::from(vec![-1.0f32, 2.0]);
        let out = HostExecutor::new().run(&main, &[input]).unwrap();
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![1.0, -2.0]);
        assert_eq!(out[1].to_f64_vec().unwrap(), vec![3.0, 5.0]);
    }

    #[test]
    fn test_input_count_checked() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        graph_input(&[1], DType::Float32, "x").unwrap();
        assert!(matches!(
            HostExecutor::new().run(&main, &[]),
            Err(GraphError::InvalidAttribute { op: "HostExecutor", .. })
        ));
    }

    #[test]
    fn test_unsupported_op() {
        reset_context();
        let ir = Ir::new();
        let main = ir.main_graph();
        let _g = main.enter().unwrap();
        let x = graph_input(&[2, 2], DType::Float32, "x").unwrap();
        graph_output(&x.transpose(None).unwrap()).unwrap();
        let input = HostArray::new(vec![0.0f32; 4], vec![2, 2]).unwrap();
        assert_eq!(
            HostExecutor::new().run(&main, &[input]).unwrap_err(),
            GraphError::Unsupported {
                component: "HostExecutor",
                op: "Transpose".to_string()
            }
        );
    }
}
