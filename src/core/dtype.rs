// This module defines the element types of tensors. DType is the user facing element type
// (bool, signed/unsigned integers, float16/32/64, complex64/128 and two narrow float8
// formats). DataType is the numeric tag stored in the IR's tensor infos, and HostType is the
// element type of host-resident arrays. DType::as_dtype resolves a DTypeLike value by trying
// four lookup tables in a fixed priority order: names, built-in scalar kinds, internal
// DataType tags and host array element types. The first match wins and a failure reports
// the offending value together with its kind.

//! Tensor element types and their resolution tables.

use std::fmt;

use super::error::{GraphError, GraphResult};
use super::host::HostArray;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    Complex64,
    Complex128,
    /// 8-bit float with 4 exponent and 3 mantissa bits.
    Float8E4M3,
    /// 8-bit float with 5 exponent and 2 mantissa bits.
    Float8E5M2,
}

/// Numeric tag stored in the IR for a tensor's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Bool = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
    Uint64 = 8,
    Float16 = 9,
    Float = 10,
    Double = 11,
    Complex64 = 12,
    Complex128 = 13,
    Float8_143 = 14,
    Float8_152 = 15,
}

/// Element type of a host-resident array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
    C64,
    C128,
}

/// Built-in scalar kinds a literal can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
}

/// Any value a [`DType`] can be resolved from.
#[derive(Debug, Clone, Copy)]
pub enum DTypeLike<'a> {
    DType(DType),
    Name(&'a str),
    Scalar(ScalarKind),
    Internal(DataType),
    Host(HostType),
    Array(&'a HostArray),
}

impl DTypeLike<'_> {
    fn kind(&self) -> &'static str {
        match self {
            DTypeLike::DType(_) => "dtype",
            DTypeLike::Name(_) => "str",
            DTypeLike::Scalar(_) => "scalar type",
            DTypeLike::Internal(_) => "internal data type",
            DTypeLike::Host(_) => "host type",
            DTypeLike::Array(_) => "host array",
        }
    }

    fn describe(&self) -> String {
        match self {
            DTypeLike::DType(d) => d.name().to_string(),
            DTypeLike::Name(s) => format!("'{s}'"),
            DTypeLike::Scalar(k) => format!("{k:?}"),
            DTypeLike::Internal(d) => format!("{d:?}"),
            DTypeLike::Host(h) => format!("{h:?}"),
            DTypeLike::Array(a) => format!("HostArray[{:?} {:?}]", a.host_type(), a.shape()),
        }
    }
}

impl From<DType> for DTypeLike<'_> {
    fn from(d: DType) -> Self {
        DTypeLike::DType(d)
    }
}

impl<'a> From<&'a str> for DTypeLike<'a> {
    fn from(s: &'a str) -> Self {
        DTypeLike::Name(s)
    }
}

impl From<ScalarKind> for DTypeLike<'_> {
    fn from(k: ScalarKind) -> Self {
        DTypeLike::Scalar(k)
    }
}

impl From<DataType> for DTypeLike<'_> {
    fn from(d: DataType) -> Self {
        DTypeLike::Internal(d)
    }
}

impl From<HostType> for DTypeLike<'_> {
    fn from(h: HostType) -> Self {
        DTypeLike::Host(h)
    }
}

impl<'a> From<&'a HostArray> for DTypeLike<'a> {
    fn from(a: &'a HostArray) -> Self {
        DTypeLike::Array(a)
    }
}

// (dtype, name, internal tag, host type, built-in scalar kind)
const TABLE: &[(DType, &str, DataType, Option<HostType>, Option<ScalarKind>)] = &[
    (DType::Bool, "bool", DataType::Bool, Some(HostType::Bool), Some(ScalarKind::Bool)),
    (DType::Int8, "int8", DataType::Int8, Some(HostType::I8), None),
    (DType::Int16, "int16", DataType::Int16, Some(HostType::I16), None),
    (DType::Int32, "int32", DataType::Int32, Some(HostType::I32), Some(ScalarKind::Int)),
    (DType::Int64, "int64", DataType::Int64, Some(HostType::I64), None),
    (DType::Uint8, "uint8", DataType::Uint8, Some(HostType::U8), None),
    (DType::Uint16, "uint16", DataType::Uint16, Some(HostType::U16), None),
    (DType::Uint32, "uint32", DataType::Uint32, Some(HostType::U32), None),
    (DType::Uint64, "uint64", DataType::Uint64, Some(HostType::U64), None),
    (DType::Float16, "float16", DataType::Float16, Some(HostType::F16), None),
    (DType::Float32, "float32", DataType::Float, Some(HostType::F32), Some(ScalarKind::Float)),
    (DType::Float64, "float64", DataType::Double, Some(HostType::F64), None),
    (DType::Complex64, "complex64", DataType::Complex64, Some(HostType::C64), None),
    (DType::Complex128, "complex128", DataType::Complex128, Some(HostType::C128), None),
    (DType::Float8E4M3, "float8_e4m3", DataType::Float8_143, None, None),
    (DType::Float8E5M2, "float8_e5m2", DataType::Float8_152, None, None),
];

const ALIASES: &[(&str, DType)] = &[
    ("half", DType::Float16),
    ("float", DType::Float32),
    ("double", DType::Float64),
];

impl DType {
    /// Every supported element type.
    pub const ALL: [DType; 16] = [
        DType::Bool,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::Uint8,
        DType::Uint16,
        DType::Uint32,
        DType::Uint64,
        DType::Float16,
        DType::Float32,
        DType::Float64,
        DType::Complex64,
        DType::Complex128,
        DType::Float8E4M3,
        DType::Float8E5M2,
    ];

    fn entry(self) -> &'static (DType, &'static str, DataType, Option<HostType>, Option<ScalarKind>) {
        // TABLE is ordered like the enum.
        &TABLE[self as usize]
    }

    /// Resolve a dtype from any supported representation.
    ///
    /// Tables are consulted in order: names, built-in scalar kinds, internal
    /// data type tags, host array element types.
    pub fn as_dtype<'a>(value: impl Into<DTypeLike<'a>>) -> GraphResult<DType> {
        let value = value.into();
        if let DTypeLike::DType(d) = value {
            return Ok(d);
        }

        Self::lookup_name(&value)
            .or_else(|| Self::lookup_scalar(&value))
            .or_else(|| Self::lookup_internal(&value))
            .or_else(|| Self::lookup_host(&value))
            .ok_or_else(|| GraphError::DTypeResolution {
                value: value.describe(),
                kind: value.kind(),
            })
    }

    fn lookup_name(value: &DTypeLike<'_>) -> Option<DType> {
        let DTypeLike::Name(name) = value else {
            return None;
        };
        TABLE
            .iter()
            .find(|entry| entry.1 == *name)
            .map(|entry| entry.0)
            .or_else(|| ALIASES.iter().find(|(a, _)| a == name).map(|(_, d)| *d))
    }

    fn lookup_scalar(value: &DTypeLike<'_>) -> Option<DType> {
        let DTypeLike::Scalar(kind) = value else {
            return None;
        };
        TABLE.iter().find(|entry| entry.4 == Some(*kind)).map(|entry| entry.0)
    }

    fn lookup_internal(value: &DTypeLike<'_>) -> Option<DType> {
        let DTypeLike::Internal(tag) = value else {
            return None;
        };
        TABLE.iter().find(|entry| entry.2 == *tag).map(|entry| entry.0)
    }

    fn lookup_host(value: &DTypeLike<'_>) -> Option<DType> {
        let host = match value {
            DTypeLike::Host(h) => *h,
            DTypeLike::Array(a) => a.host_type(),
            _ => return None,
        };
        TABLE.iter().find(|entry| entry.3 == Some(host)).map(|entry| entry.0)
    }

    /// Resolve a dtype from its name or alias.
    pub fn from_name(name: &str) -> GraphResult<DType> {
        Self::as_dtype(DTypeLike::Name(name))
    }

    /// Canonical name, e.g. `float32`.
    pub fn name(self) -> &'static str {
        self.entry().1
    }

    /// Internal tag stored in tensor infos.
    pub fn data_type(self) -> DataType {
        self.entry().2
    }

    /// Host element type of this dtype.
    pub fn as_host(self) -> GraphResult<HostType> {
        self.entry().3.ok_or(GraphError::NoHostType { dtype: self.name() })
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::Float32 | DType::Float64 | DType::Float8E4M3 | DType::Float8E5M2
        )
    }

    pub fn is_signed(self) -> bool {
        !matches!(
            self,
            DType::Bool | DType::Uint8 | DType::Uint16 | DType::Uint32 | DType::Uint64
        )
    }

    /// Integer types, excluding `bool`.
    pub fn is_int(self) -> bool {
        matches!(
            self,
            DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
                | DType::Uint8
                | DType::Uint16
                | DType::Uint32
                | DType::Uint64
        )
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::Uint8 | DType::Float8E4M3 | DType::Float8E5M2 => 1,
            DType::Int16 | DType::Uint16 | DType::Float16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 | DType::Complex64 => 8,
            DType::Complex128 => 16,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl HostType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            HostType::Bool | HostType::I8 | HostType::U8 => 1,
            HostType::I16 | HostType::U16 | HostType::F16 => 2,
            HostType::I32 | HostType::U32 | HostType::F32 => 4,
            HostType::I64 | HostType::U64 | HostType::F64 | HostType::C64 => 8,
            HostType::C128 => 16,
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, HostType::C64 | HostType::C128)
    }

    /// The 32-bit variant used when downcasting host data without an explicit dtype.
    pub fn downcast(self) -> HostType {
        match self {
            HostType::I64 => HostType::I32,
            HostType::U64 => HostType::U32,
            HostType::F64 => HostType::F32,
            other => other,
        }
    }
}
