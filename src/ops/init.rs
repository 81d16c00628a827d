use crate::context;
use crate::core::{DType, GraphError, GraphResult, InitType, OpKind, Tensor, TensorInfo};

/// Create a tensor of `shape` and `dtype` filled according to `init`.
#[track_caller]
pub fn init(shape: &[usize], dtype: DType, name: &str, init: InitType) -> GraphResult<Tensor> {
    let dc = context::op_debug_context("init", &[])?;
    let graph = context::current_graph()?;
    let settings = context::compute_op_settings("init")?;
    let (_, outputs) = graph.create_connected_op(
        OpKind::Init { init },
        settings,
        &[],
        &[(name, TensorInfo::new(dtype, shape.to_vec()))],
    )?;
    let out = outputs
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::MissingValue { id: name.to_string() })?;
    dc.record_outputs(&[&out]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{name_scope, reset_context};
    use crate::core::Ir;

    #[test]
    fn test_init_names_output() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let _s = name_scope("layer");
        let t = init(&[2, 3], DType::Float16, "buffer", InitType::Zero).unwrap();
        assert_eq!(t.id(), "layer/buffer");
        assert_eq!(t.shape(), vec![2, 3]);
        let op = t.producer().unwrap();
        assert_eq!(op.kind(), OpKind::Init { init: InitType::Zero });
        assert_eq!(op.name(), "layer/init");
    }
}
