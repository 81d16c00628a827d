//! Subgraph definition from functions and call-site binding.

use devgraph::builder::{graph_input, graph_output, variable};
use devgraph::context::reset_context;
use devgraph::ops::{call, call_with_info};
use devgraph::{
    Arg, Args, CallOutputs, DType, Graph, GraphError, GraphResult, HostArray, HostExecutor, Ir,
    OpKind, Tensor, TensorSpec,
};

mod model {
    use devgraph::{Args, GraphResult, Tensor};

    pub fn difference(args: &Args) -> GraphResult<Tensor> {
        args.tensor(0)? - args.tensor(1)?
    }

    pub fn sum(args: &Args) -> GraphResult<Tensor> {
        args.tensor(0)? + args.tensor(1)?
    }

    pub fn split(args: &Args) -> GraphResult<(Tensor, Tensor)> {
        let x = args.tensor(0)?;
        Ok((x.neg()?, (x * 2.0f32)?))
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vector(values: &[f32]) -> HostArray {
    HostArray::from(values.to_vec())
}

/// Inputs `p` and `q` of shape (2,) in the current graph.
fn parent() -> (Tensor, Tensor) {
    let p = graph_input(&[2], DType::Float32, "p").unwrap();
    let q = graph_input(&[2], DType::Float32, "q").unwrap();
    (p, q)
}

fn run_main(main: &Graph, p: &[f32], q: &[f32]) -> Vec<f64> {
    let out = HostExecutor::new()
        .run(main, &[vector(p), vector(q)])
        .unwrap();
    out[0].to_f64_vec().unwrap()
}

#[test]
fn test_create_graph_declares_inputs_and_outputs() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let (p, q) = parent();

    let sub = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();
    assert_eq!(sub.name(), "model.difference_0");
    assert_eq!(
        sub.input_ids(),
        vec!["model.difference_0/p", "model.difference_0/q"]
    );
    assert_eq!(sub.output_ids(), vec!["model.difference_0/sub_out"]);
    assert_eq!(devgraph::context::current_graph().unwrap(), ir.main_graph());

    let again = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();
    assert_eq!(again.name(), "model.difference_1");
}

#[test]
fn test_positional_round_trip() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();

    let sum = ir
        .create_graph(model::sum, Args::from_tensors(&[&p, &q]))
        .unwrap();
    let out = call(&sum, &[&p, &q], &[]).unwrap().one().unwrap();
    assert_eq!(out.shape(), vec![2]);
    assert_eq!(out.id(), "add_out");
    graph_output(&out).unwrap();
    assert_eq!(run_main(&main, &[1.0, 2.0], &[10.0, 20.0]), vec![11.0, 22.0]);
}

#[test]
fn test_binding_is_by_position_not_name() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();

    let diff = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();
    let swapped = call(&diff, &[&q, &p], &[]).unwrap().one().unwrap();
    graph_output(&swapped).unwrap();

    // q - p, although the subgraph inputs are named p and q.
    assert_eq!(run_main(&main, &[1.0, 2.0], &[10.0, 20.0]), vec![9.0, 18.0]);
}

#[test]
fn test_call_info() {
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();
    let diff = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();

    let info = call_with_info(&diff, &[&p, &q], &[]).unwrap();
    assert_eq!(info.op().name(), "main_graph--call--model.difference_0");
    assert_eq!(info.op().kind(), OpKind::Call { callee: diff.id() });
    assert_eq!(info.called_graph().unwrap(), diff);
    assert_eq!(info.inputs(), vec![p.clone(), q.clone()]);

    let sg_inputs = diff.inputs();
    assert_eq!(info.subgraph_to_op_tensor(&sg_inputs[1]).unwrap(), q);
    let sg_out = &diff.outputs()[0];
    assert_eq!(
        info.subgraph_to_op_tensor(sg_out).unwrap(),
        info.outputs()[0]
    );
    assert!(matches!(
        info.subgraph_to_op_tensor(&p),
        Err(GraphError::NotGraphIo { .. })
    ));
}

#[test]
fn test_multiple_and_no_outputs() {
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let (p, _) = parent();

    let split = ir
        .create_graph(model::split, Args::from_tensors(&[&p]))
        .unwrap();
    match call(&split, &[&p], &[]).unwrap() {
        CallOutputs::Many(outs) => {
            assert_eq!(outs.len(), 2);
            assert_eq!(outs[0].id(), "neg_out");
            assert_eq!(outs[1].id(), "mul_out");
        }
        other => panic!("expected two outputs, got {:?}", other),
    }

    let sink = ir
        .create_graph_named(
            "sink",
            |args: &Args| -> GraphResult<()> {
                args.tensor(0)?.neg()?;
                Ok(())
            },
            Args::from_tensors(&[&p]),
        )
        .unwrap();
    assert_eq!(call(&sink, &[&p], &[]).unwrap(), CallOutputs::None);
}

#[test]
fn test_explicit_mapping() {
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();
    let diff = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();
    let sg_inputs = diff.inputs();

    let out = call(&diff, &[&p], &[(&sg_inputs[1], &q)])
        .unwrap()
        .one()
        .unwrap();
    graph_output(&out).unwrap();
    assert_eq!(run_main(&main, &[5.0, 5.0], &[1.0, 2.0]), vec![4.0, 3.0]);

    // Mapping may also rebind an index already bound positionally.
    let out = call(&diff, &[&p, &p], &[(&sg_inputs[1], &q)])
        .unwrap()
        .one()
        .unwrap();
    assert_eq!(out.producer().unwrap().input(1).unwrap(), q);
}

#[test]
fn test_binding_errors() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();
    let diff = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();

    assert_eq!(
        call(&diff, &[&p, &q, &p], &[]).unwrap_err(),
        GraphError::CallInputIndex {
            graph: "model.difference_0".to_string(),
            index: 2,
            count: 2
        }
    );
    assert_eq!(
        call(&diff, &[&p], &[]).unwrap_err(),
        GraphError::UnboundCallInput {
            graph: "model.difference_0".to_string(),
            tensor: "model.difference_0/q".to_string(),
            index: 1
        }
    );

    // The parent tensor of a mapping must live in the calling graph.
    let sg_inputs = diff.inputs();
    assert!(matches!(
        call(&diff, &[&p], &[(&sg_inputs[1], &sg_inputs[0])]),
        Err(GraphError::TensorNotInGraph { .. })
    ));
    // The subgraph tensor of a mapping must live in the called graph.
    assert!(matches!(
        call(&diff, &[&p], &[(&q, &q)]),
        Err(GraphError::TensorNotInGraph { .. })
    ));
}

#[test]
fn test_shape_mismatch_is_only_logged() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let (p, q) = parent();
    let diff = ir
        .create_graph(model::difference, Args::from_tensors(&[&p, &q]))
        .unwrap();
    let wide = graph_input(&[3], DType::Float32, "wide").unwrap();
    let out = call(&diff, &[&wide, &q], &[]).unwrap().one().unwrap();
    assert_eq!(out.shape(), vec![2]);
}

#[test]
fn test_by_ref_inputs_are_modified_inputs() {
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let w = variable(vec![0.0f32; 4], None, Some("w")).unwrap();

    let args = Args::new()
        .arg(Arg::by_ref(w.tensor()))
        .arg(Arg::spec(TensorSpec::new(vec![4], DType::Float32), "delta"));
    let update = ir
        .create_graph_named(
            "update",
            |args: &Args| args.tensor(0)? + args.tensor(1)?,
            args,
        )
        .unwrap();
    assert!(update.is_by_ref_input("update_0/w"));
    assert_eq!(update.by_ref_inputs().len(), 1);

    let delta = graph_input(&[4], DType::Float32, "delta").unwrap();
    let info = call_with_info(&update, &[w.tensor(), &delta], &[]).unwrap();
    assert_eq!(info.op().modified_inputs(), vec![0]);
}

#[test]
fn test_inplace_update_through_by_ref_input() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let w = variable(vec![1.0f32, 2.0], None, Some("w")).unwrap();

    let args = Args::new()
        .arg(Arg::by_ref(w.tensor()))
        .arg(Arg::spec(TensorSpec::new(vec![2], DType::Float32), "delta"));
    let accumulate = ir
        .create_graph_named(
            "accumulate",
            |args: &Args| -> GraphResult<()> {
                let acc = args.tensor(0)?;
                let out = acc.add_(args.tensor(1)?)?;
                assert_eq!(&out, acc);
                Ok(())
            },
            args,
        )
        .unwrap();
    let body = accumulate.ops();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0].modified_inputs(), vec![0]);

    let delta = graph_input(&[2], DType::Float32, "delta").unwrap();
    let first = call_with_info(&accumulate, &[w.tensor(), &delta], &[]).unwrap();
    let second = call_with_info(&accumulate, &[w.tensor(), &delta], &[]).unwrap();
    assert!(main.topo_cons().contains(first.op().id(), second.op().id()));
    graph_output(w.tensor()).unwrap();

    let out = HostExecutor::new().run(&main, &[vector(&[10.0, 20.0])]).unwrap();
    assert_eq!(out[0].to_f64_vec().unwrap(), vec![21.0, 42.0]);
}

#[test]
fn test_subgraph_of_other_ir_rejected() {
    reset_context();
    let ir = Ir::new();
    let other = Ir::new();
    let foreign = other.create_empty_graph(Some("foreign"));
    let _g = ir.main_graph().enter().unwrap();
    assert!(matches!(
        call(&foreign, &[], &[]),
        Err(GraphError::MismatchedIr { .. })
    ));
}

#[test]
fn test_nested_calls_execute() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let (p, q) = parent();

    let sum = ir
        .create_graph(model::sum, Args::from_tensors(&[&p, &q]))
        .unwrap();
    let twice = ir
        .create_graph_named(
            "twice",
            |args: &Args| {
                let a = args.tensor(0)?;
                let b = args.tensor(1)?;
                let once = call(&sum, &[a, b], &[])?.into_vec();
                let again = call(&sum, &[&once[0], b], &[])?;
                Ok(again)
            },
            Args::from_tensors(&[&p, &q]),
        )
        .unwrap();
    let out = call(&twice, &[&p, &q], &[]).unwrap().one().unwrap();
    graph_output(&out).unwrap();
    assert_eq!(run_main(&main, &[1.0, 1.0], &[2.0, 3.0]), vec![5.0, 7.0]);
}
