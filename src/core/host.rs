//! Host-resident dense arrays used to initialise variables and constants.
//!
//! A [`HostArray`] stores a shape, an element [`HostType`] and the elements as
//! little-endian bytes. Typed constructors exist for every [`HostElement`];
//! conversion between element types goes through the [`Scalar`] view.

use half::f16;

use super::dtype::HostType;
use super::error::{GraphError, GraphResult};

/// One element read out of a host array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(f64, f64),
}

impl Scalar {
    /// Real value of the element; complex elements drop the imaginary part.
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as u8 as f64,
            Scalar::Int(i) => i as f64,
            Scalar::Uint(u) => u as f64,
            Scalar::Float(f) => f,
            Scalar::Complex(re, _) => re,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::Int(i) => i,
            Scalar::Uint(u) => u as i64,
            Scalar::Float(f) => f as i64,
            Scalar::Complex(re, _) => re as i64,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Scalar::Bool(b) => b as u64,
            Scalar::Int(i) => i as u64,
            Scalar::Uint(u) => u,
            Scalar::Float(f) => f as u64,
            Scalar::Complex(re, _) => re as u64,
        }
    }

    fn is_nonzero(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::Uint(u) => u != 0,
            Scalar::Float(f) => f != 0.0,
            Scalar::Complex(re, im) => re != 0.0 || im != 0.0,
        }
    }

    fn write(self, host_type: HostType, out: &mut Vec<u8>) {
        match host_type {
            HostType::Bool => out.push(self.is_nonzero() as u8),
            HostType::I8 => out.extend_from_slice(&(self.as_i64() as i8).to_le_bytes()),
            HostType::I16 => out.extend_from_slice(&(self.as_i64() as i16).to_le_bytes()),
            HostType::I32 => out.extend_from_slice(&(self.as_i64() as i32).to_le_bytes()),
            HostType::I64 => out.extend_from_slice(&self.as_i64().to_le_bytes()),
            HostType::U8 => out.extend_from_slice(&(self.as_u64() as u8).to_le_bytes()),
            HostType::U16 => out.extend_from_slice(&(self.as_u64() as u16).to_le_bytes()),
            HostType::U32 => out.extend_from_slice(&(self.as_u64() as u32).to_le_bytes()),
            HostType::U64 => out.extend_from_slice(&self.as_u64().to_le_bytes()),
            HostType::F16 => out.extend_from_slice(&f16::from_f64(self.as_f64()).to_le_bytes()),
            HostType::F32 => out.extend_from_slice(&(self.as_f64() as f32).to_le_bytes()),
            HostType::F64 => out.extend_from_slice(&self.as_f64().to_le_bytes()),
            HostType::C64 | HostType::C128 => {
                let (re, im) = match self {
                    Scalar::Complex(re, im) => (re, im),
                    other => (other.as_f64(), 0.0),
                };
                if host_type == HostType::C64 {
                    out.extend_from_slice(&(re as f32).to_le_bytes());
                    out.extend_from_slice(&(im as f32).to_le_bytes());
                } else {
                    out.extend_from_slice(&re.to_le_bytes());
                    out.extend_from_slice(&im.to_le_bytes());
                }
            }
        }
    }
}

/// Rust element types that can back a [`HostArray`].
pub trait HostElement: Copy {
    const HOST_TYPE: HostType;

    fn to_scalar(self) -> Scalar;
}

macro_rules! host_element {
    ($ty:ty, $host:expr, $variant:ident, $conv:ty) => {
        impl HostElement for $ty {
            const HOST_TYPE: HostType = $host;

            fn to_scalar(self) -> Scalar {
                Scalar::$variant(self as $conv)
            }
        }
    };
}

host_element!(i8, HostType::I8, Int, i64);
host_element!(i16, HostType::I16, Int, i64);
host_element!(i32, HostType::I32, Int, i64);
host_element!(i64, HostType::I64, Int, i64);
host_element!(u8, HostType::U8, Uint, u64);
host_element!(u16, HostType::U16, Uint, u64);
host_element!(u32, HostType::U32, Uint, u64);
host_element!(u64, HostType::U64, Uint, u64);
host_element!(f32, HostType::F32, Float, f64);
host_element!(f64, HostType::F64, Float, f64);

impl HostElement for bool {
    const HOST_TYPE: HostType = HostType::Bool;

    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }
}

impl HostElement for f16 {
    const HOST_TYPE: HostType = HostType::F16;

    fn to_scalar(self) -> Scalar {
        Scalar::Float(self.to_f64())
    }
}

/// Dense host data with a shape and an element type.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    shape: Vec<usize>,
    host_type: HostType,
    bytes: Vec<u8>,
}

impl HostArray {
    /// Build an array from typed elements in row-major order.
    pub fn new<T: HostElement>(data: Vec<T>, shape: Vec<usize>) -> GraphResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(GraphError::HostData {
                reason: format!(
                    "{} elements cannot fill shape {:?} ({} elements)",
                    data.len(),
                    shape,
                    expected
                ),
            });
        }
        Ok(Self::from_scalars(T::HOST_TYPE, shape, data.into_iter().map(T::to_scalar)))
    }

    /// A 0-d array holding one element.
    pub fn scalar<T: HostElement>(value: T) -> Self {
        Self::from_scalars(T::HOST_TYPE, Vec::new(), std::iter::once(value.to_scalar()))
    }

    /// A 1-d array.
    pub fn from_vec<T: HostElement>(data: Vec<T>) -> Self {
        let len = data.len();
        Self::from_scalars(T::HOST_TYPE, vec![len], data.into_iter().map(T::to_scalar))
    }

    /// A 2-d array from rows; all rows must have the same length.
    pub fn from_rows<T: HostElement>(rows: Vec<Vec<T>>) -> GraphResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(GraphError::HostData {
                reason: format!("ragged rows: expected {} columns, found {}", cols, bad.len()),
            });
        }
        let shape = vec![rows.len(), cols];
        Ok(Self::from_scalars(
            T::HOST_TYPE,
            shape,
            rows.into_iter().flatten().map(T::to_scalar),
        ))
    }

    /// Build an array of `host_type` from an element iterator, converting each element.
    pub fn from_scalars(
        host_type: HostType,
        shape: Vec<usize>,
        scalars: impl IntoIterator<Item = Scalar>,
    ) -> Self {
        let mut bytes = Vec::with_capacity(shape.iter().product::<usize>() * host_type.size_in_bytes());
        for s in scalars {
            s.write(host_type, &mut bytes);
        }
        Self { shape, host_type, bytes }
    }

    /// Real-valued array from f64 values.
    pub fn from_f64(host_type: HostType, shape: Vec<usize>, data: &[f64]) -> Self {
        Self::from_scalars(host_type, shape, data.iter().map(|v| Scalar::Float(*v)))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    /// Raw little-endian element bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn nelms(&self) -> usize {
        self.shape.iter().product()
    }

    /// Read element `idx` in row-major order.
    pub fn get(&self, idx: usize) -> Option<Scalar> {
        let size = self.host_type.size_in_bytes();
        let b = self.bytes.get(idx * size..(idx + 1) * size)?;
        let scalar = match self.host_type {
            HostType::Bool => Scalar::Bool(b[0] != 0),
            HostType::I8 => Scalar::Int(i8::from_le_bytes([b[0]]) as i64),
            HostType::I16 => Scalar::Int(i16::from_le_bytes([b[0], b[1]]) as i64),
            HostType::I32 => Scalar::Int(i32::from_le_bytes(b.try_into().ok()?) as i64),
            HostType::I64 => Scalar::Int(i64::from_le_bytes(b.try_into().ok()?)),
            HostType::U8 => Scalar::Uint(b[0] as u64),
            HostType::U16 => Scalar::Uint(u16::from_le_bytes([b[0], b[1]]) as u64),
            HostType::U32 => Scalar::Uint(u32::from_le_bytes(b.try_into().ok()?) as u64),
            HostType::U64 => Scalar::Uint(u64::from_le_bytes(b.try_into().ok()?)),
            HostType::F16 => Scalar::Float(f16::from_le_bytes([b[0], b[1]]).to_f64()),
            HostType::F32 => Scalar::Float(f32::from_le_bytes(b.try_into().ok()?) as f64),
            HostType::F64 => Scalar::Float(f64::from_le_bytes(b.try_into().ok()?)),
            HostType::C64 => Scalar::Complex(
                f32::from_le_bytes(b[..4].try_into().ok()?) as f64,
                f32::from_le_bytes(b[4..].try_into().ok()?) as f64,
            ),
            HostType::C128 => Scalar::Complex(
                f64::from_le_bytes(b[..8].try_into().ok()?),
                f64::from_le_bytes(b[8..].try_into().ok()?),
            ),
        };
        Some(scalar)
    }

    /// Iterate elements in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = Scalar> + '_ {
        (0..self.nelms()).filter_map(move |i| self.get(i))
    }

    /// Convert every element to `host_type`.
    pub fn cast(&self, host_type: HostType) -> HostArray {
        if host_type == self.host_type {
            return self.clone();
        }
        Self::from_scalars(host_type, self.shape.clone(), self.iter())
    }

    /// Narrow 64-bit integer and float data to 32 bits.
    pub fn downcast(&self) -> HostArray {
        self.cast(self.host_type.downcast())
    }

    /// Real element values; fails for complex data.
    pub fn to_f64_vec(&self) -> GraphResult<Vec<f64>> {
        if self.host_type.is_complex() {
            return Err(GraphError::HostData {
                reason: "complex data has no real view".to_string(),
            });
        }
        Ok(self.iter().map(Scalar::as_f64).collect())
    }
}

impl<T: HostElement> From<T> for HostArray {
    fn from(value: T) -> Self {
        HostArray::scalar(value)
    }
}

impl<T: HostElement> From<Vec<T>> for HostArray {
    fn from(data: Vec<T>) -> Self {
        HostArray::from_vec(data)
    }
}

impl<T: HostElement> From<&[T]> for HostArray {
    fn from(data: &[T]) -> Self {
        HostArray::from_vec(data.to_vec())
    }
}

impl<T: HostElement, const N: usize> From<[T; N]> for HostArray {
    fn from(data: [T; N]) -> Self {
        HostArray::from_vec(data.to_vec())
    }
}

impl<T: HostElement, const N: usize, const M: usize> From<[[T; N]; M]> for HostArray {
    fn from(data: [[T; N]; M]) -> Self {
        HostArray::from_scalars(
            T::HOST_TYPE,
            vec![M, N],
            data.into_iter().flatten().map(T::to_scalar),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_from_literals() {
        assert_eq!(HostArray::from(1.0f32).shape(), &[] as &[usize]);
        assert_eq!(HostArray::from(vec![1i32, 2, 3]).shape(), &[3]);
        assert_eq!(HostArray::from([[true], [false], [true]]).shape(), &[3, 1]);
    }

    #[test]
    fn test_new_checks_element_count() {
        assert!(HostArray::new(vec![1.0f32; 5], vec![2, 3]).is_err());
        let a = HostArray::new(vec![1.0f32; 6], vec![2, 3]).unwrap();
        assert_eq!(a.nelms(), 6);
        assert_eq!(a.bytes().len(), 24);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(HostArray::from_rows(vec![vec![1i32, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_downcast_narrows_64_bit_types() {
        let a = HostArray::from(vec![1i64, -2, 3]);
        let d = a.downcast();
        assert_eq!(d.host_type(), HostType::I32);
        assert_eq!(d.get(1), Some(Scalar::Int(-2)));

        let f = HostArray::from(2.5f64).downcast();
        assert_eq!(f.host_type(), HostType::F32);
        assert_eq!(f.get(0), Some(Scalar::Float(2.5)));

        let b = HostArray::from(true).downcast();
        assert_eq!(b.host_type(), HostType::Bool);
    }

    #[test]
    fn test_cast_between_types() {
        let a = HostArray::from(vec![0.0f32, 1.5, -3.0]);
        let b = a.cast(HostType::Bool);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![
            Scalar::Bool(false),
            Scalar::Bool(true),
            Scalar::Bool(true)
        ]);
        let h = a.cast(HostType::F16);
        assert_eq!(h.to_f64_vec().unwrap(), vec![0.0, 1.5, -3.0]);
        let c = a.cast(HostType::C64);
        assert_eq!(c.get(1), Some(Scalar::Complex(1.5, 0.0)));
        assert!(c.to_f64_vec().is_err());
    }
}
