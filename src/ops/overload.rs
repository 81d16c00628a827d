// This module puts graph construction behind Tensor's named methods and Rust operators. None of
// them computes values: `&a + &b` inserts an Add op into the current graph and returns its
// output, so every operator returns GraphResult<Tensor>. Non-tensor operands (scalars, host
// arrays, vectors) are coerced by ensure_tensor into a new constant of the tensor operand's
// dtype; a coercion producing zero elements is rejected as a likely mistake. Every operator
// goes through exactly one builder in elementwise/shape, so one expression term creates one op.

//! Tensor methods and operator overloads.

use std::ops::{Add, AddAssign, BitAnd, BitOr, Div, Mul, Neg, Not, Rem, Sub};

use half::f16;

use super::{elementwise, shape};
use crate::builder;
use crate::core::{
    Constant, DType, GraphError, GraphResult, HostArray, HostElement, Tensor, Variable,
};

/// Coerce host data into a new constant of `dtype` in the current graph.
///
/// Fails with [`GraphError::EmptyOperand`] when the data has no elements.
#[track_caller]
pub fn ensure_tensor(value: impl Into<HostArray>, dtype: DType) -> GraphResult<Tensor> {
    let value = value.into();
    if value.nelms() == 0 {
        return Err(GraphError::EmptyOperand {
            kind: "host array",
            value: format!("{:?} with shape {:?}", value.host_type(), value.shape()),
        });
    }
    builder::constant(value, Some(dtype), None).map(Constant::into_tensor)
}

/// A value usable as the other operand of a tensor operation.
pub trait Operand {
    /// Resolve to a tensor, coercing host values to the dtype of `like`.
    fn into_operand(self, like: &Tensor) -> GraphResult<Tensor>;
}

impl Operand for Tensor {
    fn into_operand(self, _like: &Tensor) -> GraphResult<Tensor> {
        Ok(self)
    }
}

impl Operand for &Tensor {
    fn into_operand(self, _like: &Tensor) -> GraphResult<Tensor> {
        Ok(self.clone())
    }
}

impl Operand for &Variable {
    fn into_operand(self, _like: &Tensor) -> GraphResult<Tensor> {
        Ok(self.tensor().clone())
    }
}

impl Operand for &Constant {
    fn into_operand(self, _like: &Tensor) -> GraphResult<Tensor> {
        Ok(self.tensor().clone())
    }
}

impl Operand for HostArray {
    fn into_operand(self, like: &Tensor) -> GraphResult<Tensor> {
        ensure_tensor(self, like.dtype())
    }
}

impl<T: HostElement> Operand for Vec<T> {
    fn into_operand(self, like: &Tensor) -> GraphResult<Tensor> {
        ensure_tensor(self, like.dtype())
    }
}

macro_rules! impl_scalar_operand {
    ($($t:ty),*) => {$(
        impl Operand for $t {
            fn into_operand(self, like: &Tensor) -> GraphResult<Tensor> {
                ensure_tensor(self, like.dtype())
            }
        }
    )*};
}

impl_scalar_operand!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f16, f32, f64);

impl Tensor {
    #[track_caller]
    pub fn add(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::add(self, &rhs.into_operand(self)?)
    }

    /// Add `rhs` into this tensor in place and return it.
    #[track_caller]
    pub fn add_(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::add_(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn sub(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::sub(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn mul(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::mul(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn div(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::div(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn fmod(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::fmod(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn neg(&self) -> GraphResult<Tensor> {
        elementwise::neg(self)
    }

    #[track_caller]
    pub fn relu(&self) -> GraphResult<Tensor> {
        elementwise::relu(self)
    }

    #[track_caller]
    pub fn relu_(&self) -> GraphResult<Tensor> {
        elementwise::relu_(self)
    }

    /// `self = a * self + b * y`, in place.
    #[track_caller]
    pub fn scaled_add_(&self, y: impl Operand, a: f64, b: f64) -> GraphResult<Tensor> {
        elementwise::scaled_add_(self, &y.into_operand(self)?, a, b)
    }

    #[track_caller]
    pub fn detach(&self) -> GraphResult<Tensor> {
        elementwise::detach(self)
    }

    #[track_caller]
    pub fn detach_(&self) -> GraphResult<Tensor> {
        elementwise::detach_(self)
    }

    #[track_caller]
    pub fn matmul(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::matmul(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn logical_and(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::logical_and(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn logical_or(&self, rhs: impl Operand) -> GraphResult<Tensor> {
        elementwise::logical_or(self, &rhs.into_operand(self)?)
    }

    #[track_caller]
    pub fn logical_not(&self) -> GraphResult<Tensor> {
        elementwise::logical_not(self)
    }

    #[track_caller]
    pub fn cast(&self, dtype: DType) -> GraphResult<Tensor> {
        elementwise::cast(self, dtype)
    }

    /// Reverse the axes, or permute them by `permutation`.
    #[track_caller]
    pub fn transpose(&self, permutation: Option<&[usize]>) -> GraphResult<Tensor> {
        shape::transpose(self, permutation)
    }

    #[track_caller]
    pub fn transpose_(&self, permutation: Option<&[usize]>) -> GraphResult<Tensor> {
        shape::transpose_(self, permutation)
    }

    /// The tensor with its axes reversed.
    #[track_caller]
    pub fn t(&self) -> GraphResult<Tensor> {
        shape::transpose(self, None)
    }

    #[track_caller]
    pub fn t_(&self) -> GraphResult<Tensor> {
        shape::transpose_(self, None)
    }

    #[track_caller]
    pub fn reshape(&self, shape: &[i64]) -> GraphResult<Tensor> {
        shape::reshape(self, shape)
    }

    #[track_caller]
    pub fn reshape_(&self, shape: &[i64]) -> GraphResult<Tensor> {
        shape::reshape_(self, shape)
    }

    #[track_caller]
    pub fn flatten(&self) -> GraphResult<Tensor> {
        shape::flatten(self)
    }

    #[track_caller]
    pub fn flatten_(&self) -> GraphResult<Tensor> {
        shape::flatten_(self)
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident) => {
        impl<R: Operand> $trait<R> for &Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self, rhs: R) -> GraphResult<Tensor> {
                Tensor::$method(self, rhs)
            }
        }

        impl<R: Operand> $trait<R> for Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self, rhs: R) -> GraphResult<Tensor> {
                Tensor::$method(&self, rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add);
impl_binary_operator!(Sub, sub);
impl_binary_operator!(Mul, mul);
impl_binary_operator!(Div, div);

macro_rules! impl_named_binary_operator {
    ($trait:ident, $method:ident, $named:ident) => {
        impl<R: Operand> $trait<R> for &Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self, rhs: R) -> GraphResult<Tensor> {
                self.$named(rhs)
            }
        }

        impl<R: Operand> $trait<R> for Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self, rhs: R) -> GraphResult<Tensor> {
                (&self).$named(rhs)
            }
        }
    };
}

impl_named_binary_operator!(Rem, rem, fmod);
impl_named_binary_operator!(BitAnd, bitand, logical_and);
impl_named_binary_operator!(BitOr, bitor, logical_or);

macro_rules! impl_unary_operator {
    ($trait:ident, $method:ident, $named:ident) => {
        impl $trait for &Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self) -> GraphResult<Tensor> {
                Tensor::$named(self)
            }
        }

        impl $trait for Tensor {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn $method(self) -> GraphResult<Tensor> {
                Tensor::$named(&self)
            }
        }
    };
}

impl_unary_operator!(Neg, neg, neg);
impl_unary_operator!(Not, not, logical_not);

/// `x += y` builds an in-place add on `x`.
///
/// # Panics
///
/// `AddAssign` cannot return an error, so a failure to build the op (mismatched
/// dtypes, a broadcast that would grow `x`, no active graph) panics. Use
/// [`Tensor::add_`] to handle these as errors.
impl<R: Operand> AddAssign<R> for Tensor {
    #[track_caller]
    fn add_assign(&mut self, rhs: R) {
        if let Err(err) = Tensor::add_(self, rhs) {
            panic!("in-place add on {} failed: {}", self.id(), err);
        }
    }
}

// Scalar on the left: the scalar becomes a constant of the tensor's dtype.
macro_rules! impl_reflected_operator {
    ($($t:ty),*) => {$(
        impl Add<&Tensor> for $t {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn add(self, rhs: &Tensor) -> GraphResult<Tensor> {
                elementwise::add(&ensure_tensor(self, rhs.dtype())?, rhs)
            }
        }

        impl Sub<&Tensor> for $t {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn sub(self, rhs: &Tensor) -> GraphResult<Tensor> {
                elementwise::sub(&ensure_tensor(self, rhs.dtype())?, rhs)
            }
        }

        impl Mul<&Tensor> for $t {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn mul(self, rhs: &Tensor) -> GraphResult<Tensor> {
                elementwise::mul(&ensure_tensor(self, rhs.dtype())?, rhs)
            }
        }

        impl Div<&Tensor> for $t {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn div(self, rhs: &Tensor) -> GraphResult<Tensor> {
                elementwise::div(&ensure_tensor(self, rhs.dtype())?, rhs)
            }
        }

        impl Rem<&Tensor> for $t {
            type Output = GraphResult<Tensor>;

            #[track_caller]
            fn rem(self, rhs: &Tensor) -> GraphResult<Tensor> {
                elementwise::fmod(&ensure_tensor(self, rhs.dtype())?, rhs)
            }
        }
    )*};
}

impl_reflected_operator!(i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::builder::{graph_input, variable};
    use crate::context::{register_op_created_hook, remove_op_created_hook, reset_context};
    use crate::core::{Ir, OpKind, TensorKind};

    #[test]
    fn test_scalar_operand_becomes_constant() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Float16, "x").unwrap();
        let y = (&x + 1.0f64).unwrap();
        let op = y.producer().unwrap();
        let rhs = op.input(1).unwrap();
        assert_eq!(rhs.kind(), TensorKind::Constant);
        assert_eq!(rhs.dtype(), DType::Float16);
        assert_eq!(rhs.shape(), Vec::<usize>::new());
    }

    #[test]
    fn test_one_op_per_term() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        let hook = register_op_created_hook(move |_| seen.set(seen.get() + 1));
        let x = variable(vec![1.0f32, 2.0], None, Some("x")).unwrap();
        let y = (&*x * 2.0f32).unwrap();
        let z = (3.0f32 - &y).unwrap();
        let w = (-&z).unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(w.producer().unwrap().kind(), OpKind::Neg);
        remove_op_created_hook(hook).unwrap();
    }

    #[test]
    fn test_empty_operand_rejected() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        let err = x.add(Vec::<f32>::new()).unwrap_err();
        assert!(matches!(err, GraphError::EmptyOperand { .. }));
        assert!(ir.main_graph().ops().is_empty());
    }

    #[test]
    fn test_operand_of_other_graph_rejected() {
        reset_context();
        let ir = Ir::new();
        let sub = ir.create_empty_graph(None);
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Float32, "x").unwrap();
        let y = sub.within(|| graph_input(&[2], DType::Float32, "y")).unwrap();
        assert!(matches!(
            &x + &y,
            Err(GraphError::TensorNotInGraph { .. })
        ));
    }

    #[test]
    fn test_logical_operators() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let a = graph_input(&[2], DType::Bool, "a").unwrap();
        let b = graph_input(&[2], DType::Bool, "b").unwrap();
        assert_eq!((&a & &b).unwrap().producer().unwrap().op_type(), "And");
        assert_eq!((&a | &b).unwrap().producer().unwrap().op_type(), "Or");
        assert_eq!((!&a).unwrap().producer().unwrap().op_type(), "Not");
        // Owned operands take the same paths.
        assert_eq!((a.clone() & b.clone()).unwrap().producer().unwrap().op_type(), "And");
        assert_eq!((a.clone() | b).unwrap().producer().unwrap().op_type(), "Or");
        assert_eq!((!a).unwrap().producer().unwrap().op_type(), "Not");
    }

    #[test]
    fn test_owned_arithmetic_operators() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let x = graph_input(&[2], DType::Int32, "x").unwrap();
        assert_eq!((x.clone() % 3i32).unwrap().producer().unwrap().kind(), OpKind::Fmod);
        assert_eq!((-x).unwrap().producer().unwrap().kind(), OpKind::Neg);
    }

    #[test]
    fn test_add_assign_builds_inplace_add() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let mut x = graph_input(&[2], DType::Float32, "x").unwrap();
        let original = x.clone();
        x += 1.0f32;
        assert!(x.same_object(&original));

        let ops = ir.main_graph().ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), OpKind::Add);
        assert_eq!(ops[0].modified_inputs(), vec![0]);
        assert_eq!(ops[0].input(0).unwrap(), x);

        let r = x.relu_().unwrap();
        assert_eq!(r, x);
        let v = x.t_().unwrap();
        assert_ne!(v, x);
        assert_eq!(v.producer().unwrap().modified_inputs(), vec![0]);
    }

    #[test]
    #[should_panic(expected = "in-place add on x failed")]
    fn test_add_assign_panics_when_result_does_not_fit() {
        reset_context();
        let ir = Ir::new();
        let _g = ir.main_graph().enter().unwrap();
        let mut x = graph_input(&[2], DType::Float32, "x").unwrap();
        x += vec![1.0f32, 2.0, 3.0];
    }
}
