//! Context stack behaviour: graph nesting, scoped settings and op-created hooks.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use devgraph::builder::{graph_input, variable};
use devgraph::context::{
    self, current_graph, in_sequence, name_scope, pipeline_stage, register_op_created_hook,
    remove_op_created_hook, reset_context, virtual_graph, with_context,
};
use devgraph::ops::{self, relu};
use devgraph::{DType, GraphError, Ir};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_scopes_restored_after_panic() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let _v = virtual_graph(1);
    let _n = name_scope("outer");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _v = virtual_graph(7);
        let _p = pipeline_stage(3);
        let _n = name_scope("inner");
        let _s = in_sequence(true).unwrap();
        panic!("graph construction failed");
    }));
    assert!(result.is_err());

    with_context(|ctx| {
        assert_eq!(ctx.virtual_graph_id(), Some(1));
        assert_eq!(ctx.pipeline_stage(), None);
        assert_eq!(ctx.name_scopes().to_vec(), vec!["outer".to_string()]);
        assert_eq!(ctx.in_sequence(), None);
        assert_eq!(ctx.graphs().len(), 1);
    });
}

#[test]
fn test_scopes_restored_after_error() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let sub = ir.create_empty_graph(Some("sub"));

    let result = sub.within(|| {
        let _n = name_scope("blk");
        let _v = virtual_graph(2);
        variable(1.0f32, None, None)
    });
    assert_eq!(result.unwrap_err(), GraphError::VariableOutsideMainGraph);
    assert_eq!(current_graph().unwrap(), main);
    assert!(context::name_scopes().is_empty());
    assert_eq!(with_context(|ctx| ctx.virtual_graph_id()), None);
}

#[test]
fn test_nested_ir_rejected() {
    init_logger();
    reset_context();
    let a = Ir::new();
    let b = Ir::new();
    let _ga = a.main_graph().enter().unwrap();
    let sub = a.create_empty_graph(None);
    let _gs = sub.enter().unwrap();
    assert!(matches!(
        b.main_graph().enter(),
        Err(GraphError::MismatchedIr { .. })
    ));
    assert_eq!(current_graph().unwrap(), sub);
}

#[test]
fn test_no_graph_error_mentions_scope() {
    reset_context();
    let err = current_graph().unwrap_err();
    assert!(err.to_string().contains("graph scope"));
}

#[test]
fn test_ops_carry_placement_and_names() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let x = graph_input(&[4], DType::Float32, "x").unwrap();
    let y = context::with_virtual_graph(1, || {
        context::with_pipeline_stage(2, || context::with_name_scope("layer0", || relu(&x)))
    })
    .unwrap();
    let op = y.producer().unwrap();
    let settings = op.settings();
    assert_eq!(settings.virtual_graph_id, Some(1));
    assert_eq!(settings.pipeline_stage, Some(2));
    assert_eq!(op.name(), "layer0/relu");
    assert_eq!(y.id(), "layer0/relu_out");
}

#[test]
fn test_virtual_graph_defaults_to_none() {
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let x = graph_input(&[4], DType::Float32, "x").unwrap();
    let op = relu(&x).unwrap().producer().unwrap();
    assert_eq!(op.settings().virtual_graph_id, None);
}

#[test]
fn test_hook_sees_every_op_once_in_order() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let hook = register_op_created_hook(move |op| sink.borrow_mut().push(op.id()));

    let x = graph_input(&[2, 3], DType::Float32, "x").unwrap();
    let y = relu(&x).unwrap();
    // Fails inference before any op is inserted.
    assert!(ops::matmul(&y, &y).is_err());
    let z = (&y + &x).unwrap();
    let w = z.index(0).unwrap();

    let created: Vec<_> = ir.main_graph().ops().iter().map(|op| op.id()).collect();
    assert_eq!(*seen.borrow(), created);
    assert_eq!(created.len(), 4);
    assert_eq!(w.shape(), vec![3]);

    remove_op_created_hook(hook).unwrap();
    relu(&x).unwrap();
    assert_eq!(seen.borrow().len(), 4);
}

#[test]
fn test_call_fires_hook_once() {
    reset_context();
    let ir = Ir::new();
    let _g = ir.main_graph().enter().unwrap();
    let x = graph_input(&[2], DType::Float32, "x").unwrap();
    let sub = ir
        .create_graph_named(
            "double",
            |args: &devgraph::Args| args.tensor(0)?.mul(2.0f32),
            devgraph::Args::from_tensors(&[&x]),
        )
        .unwrap();

    let count = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&count);
    let _hook = register_op_created_hook(move |_| *sink.borrow_mut() += 1);
    ops::call(&sub, &[&x], &[]).unwrap();
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_hook_fires_for_partially_built_call() {
    init_logger();
    reset_context();
    let ir = Ir::new();
    let main = ir.main_graph();
    let _g = main.enter().unwrap();
    let p = graph_input(&[2], DType::Float32, "p").unwrap();
    let q = graph_input(&[2], DType::Float32, "q").unwrap();
    let diff = ir
        .create_graph_named(
            "diff",
            |args: &devgraph::Args| args.tensor(0)? - args.tensor(1)?,
            devgraph::Args::from_tensors(&[&p, &q]),
        )
        .unwrap();

    let count = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&count);
    let hook = register_op_created_hook(move |_| *sink.borrow_mut() += 1);

    // The call op is inserted before binding finds the second input unbound.
    let err = ops::call(&diff, &[&p], &[]).unwrap_err();
    assert!(matches!(err, GraphError::UnboundCallInput { index: 1, .. }));
    assert_eq!(*count.borrow(), 1);
    assert_eq!(main.ops().len(), *count.borrow());
    remove_op_created_hook(hook).unwrap();
}
