//! Tagged value type shared by properties, signal values and wire messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::Time;
use crate::{Error, Result};

/// Inline storage for short vectors; most signals are length 1..4.
pub type Vector<T> = SmallVec<[T; 4]>;

/// Element type tag. Discriminants are the single-character wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Type {
    Bool = b'b',
    Type = b'c',
    Double = b'd',
    Float = b'f',
    Int64 = b'h',
    Int32 = b'i',
    String = b's',
    Time = b't',
    Pointer = b'v',
    Null = b'N',
}

impl Type {
    pub fn code(self) -> char {
        self as u8 as char
    }

    pub fn from_code(code: char) -> Option<Type> {
        Some(match code {
            'b' => Type::Bool,
            'c' => Type::Type,
            'd' => Type::Double,
            'f' => Type::Float,
            'h' => Type::Int64,
            'i' => Type::Int32,
            's' => Type::String,
            't' => Type::Time,
            'v' => Type::Pointer,
            'N' => Type::Null,
            _ => return None,
        })
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int32 | Type::Int64 | Type::Float | Type::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Bool => "BOOLEAN",
            Type::Type => "TYPE",
            Type::Double => "DOUBLE",
            Type::Float => "FLOAT",
            Type::Int64 => "INT64",
            Type::Int32 => "INT32",
            Type::String => "STRING",
            Type::Time => "TIME",
            Type::Pointer => "POINTER",
            Type::Null => "NULL",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed scalar or fixed-length vector.
///
/// Every non-null variant holds at least one element; the constructors and
/// [`Value::normalized`] fold empty vectors into `Null`, so a length of zero
/// always means "absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(Vector<bool>),
    Type(Vector<Type>),
    Int32(Vector<i32>),
    Int64(Vector<i64>),
    Float(Vector<f32>),
    Double(Vector<f64>),
    String(Vector<String>),
    Time(Vector<Time>),
    /// Opaque host pointer; never dereferenced, only carried.
    Pointer(Vector<u64>),
}

// ============================================================================
// Shape and type inspection
// ============================================================================

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Bool(_) => Type::Bool,
            Value::Type(_) => Type::Type,
            Value::Int32(_) => Type::Int32,
            Value::Int64(_) => Type::Int64,
            Value::Float(_) => Type::Float,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::Time(_) => Type::Time,
            Value::Pointer(_) => Type::Pointer,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_of().name()
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Bool(v) => v.len(),
            Value::Type(v) => v.len(),
            Value::Int32(v) => v.len(),
            Value::Int64(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Double(v) => v.len(),
            Value::String(v) => v.len(),
            Value::Time(v) => v.len(),
            Value::Pointer(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        self.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.len() == 1
    }

    /// Fold zero-length vectors into `Null`.
    pub fn normalized(self) -> Value {
        if self.is_empty() { Value::Null } else { self }
    }

    /// Numeric contents widened to f64. `None` for non-numeric values.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Value::Int32(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::Int64(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::Float(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::Double(v) => Some(v.to_vec()),
            _ => None,
        }
    }

    /// Build a numeric value of type `ty` from f64 elements.
    pub fn from_f64s(ty: Type, items: &[f64]) -> Result<Value> {
        let value = match ty {
            Type::Int32 => Value::Int32(items.iter().map(|x| x.round() as i32).collect()),
            Type::Int64 => Value::Int64(items.iter().map(|x| x.round() as i64).collect()),
            Type::Float => Value::Float(items.iter().map(|x| *x as f32).collect()),
            Type::Double => Value::Double(items.iter().copied().collect()),
            other => {
                return Err(Error::TypeMismatch {
                    expected: "numeric type".into(),
                    got: other.name().into(),
                });
            }
        };
        Ok(value.normalized())
    }

    /// Explicit numeric conversion, used where a map transfers values
    /// between signals of different numeric types.
    pub fn coerce(&self, to: Type) -> Result<Value> {
        if self.type_of() == to {
            return Ok(self.clone());
        }
        match self.to_f64_vec() {
            Some(items) if to.is_numeric() => Value::from_f64s(to, &items),
            _ => Err(Error::TypeMismatch {
                expected: to.name().into(),
                got: self.type_name().into(),
            }),
        }
    }

    /// Materialize as a scalar when length is 1, otherwise as a vector.
    pub fn materialize<T: Scalar>(&self) -> Result<Option<Shaped<T>>> {
        if self.is_null() {
            return Ok(None);
        }
        let items = T::slice(self).ok_or_else(|| Error::TypeMismatch {
            expected: T::TYPE.name().into(),
            got: self.type_name().into(),
        })?;
        Ok(Some(match items {
            [one] => Shaped::Scalar(one.clone()),
            many => Shaped::Vector(many.to_vec()),
        }))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) if v.len() == 1 => Some(&v[0]),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) if v.len() == 1 => Some(v[0] as i64),
            Value::Int64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

/// A materialized property or signal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaped<T> {
    Scalar(T),
    Vector(Vec<T>),
}

// ============================================================================
// Scalar element types
// ============================================================================

/// Element types that can be read out of a `Value` without conversion.
pub trait Scalar: Clone + Send + 'static {
    const TYPE: Type;
    fn slice(value: &Value) -> Option<&[Self]>;
    fn wrap(items: Vector<Self>) -> Value;
}

macro_rules! scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            const TYPE: Type = Type::$variant;

            fn slice(value: &Value) -> Option<&[Self]> {
                match value {
                    Value::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn wrap(items: Vector<Self>) -> Value {
                Value::$variant(items).normalized()
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(smallvec::smallvec![v])
            }
        }

        impl From<Vec<$ty>> for Value {
            fn from(v: Vec<$ty>) -> Self {
                Value::$variant(Vector::from_vec(v)).normalized()
            }
        }

        impl From<&[$ty]> for Value {
            fn from(v: &[$ty]) -> Self {
                Value::$variant(v.iter().cloned().collect()).normalized()
            }
        }

        impl FromValue for $ty {
            fn from_value(val: &Value) -> Result<Self> {
                match <$ty as Scalar>::slice(val) {
                    Some([one]) => Ok(one.clone()),
                    _ => Err(Error::TypeMismatch {
                        expected: format!("scalar {}", Type::$variant.name()),
                        got: describe(val),
                    }),
                }
            }
        }

        impl FromValue for Vec<$ty> {
            fn from_value(val: &Value) -> Result<Self> {
                <$ty as Scalar>::slice(val)
                    .filter(|items| !items.is_empty())
                    .map(|items| items.to_vec())
                    .ok_or_else(|| Error::TypeMismatch {
                        expected: format!("vector {}", Type::$variant.name()),
                        got: describe(val),
                    })
            }
        }
    };
}

scalar!(bool, Bool);
scalar!(Type, Type);
scalar!(i32, Int32);
scalar!(i64, Int64);
scalar!(f32, Float);
scalar!(f64, Double);
scalar!(String, String);
scalar!(Time, Time);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(smallvec::smallvec![v.to_owned()])
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn describe(val: &Value) -> String {
    format!("{}[{}]", val.type_name(), val.len())
}

/// Convert from Value to concrete types, rejecting any type or shape mismatch.
pub trait FromValue: Sized {
    fn from_value(val: &Value) -> Result<Self>;
}

// ============================================================================
// Display
// ============================================================================

fn write_items<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    if let [one] = items {
        return write!(f, "{one}");
    }
    write!(f, "[")?;
    for (i, v) in items.iter().enumerate() {
        if i > 0 { write!(f, ", ")?; }
        write!(f, "{v}")?;
    }
    write!(f, "]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write_items(f, v),
            Value::Type(v) => {
                let codes: Vec<char> = v.iter().map(|t| t.code()).collect();
                write_items(f, &codes)
            }
            Value::Int32(v) => write_items(f, v),
            Value::Int64(v) => write_items(f, v),
            Value::Float(v) => write_items(f, v),
            Value::Double(v) => write_items(f, v),
            Value::String(v) => {
                let quoted: Vec<String> = v.iter().map(|s| format!("'{s}'")).collect();
                write_items(f, &quoted)
            }
            Value::Time(v) => write_items(f, v),
            Value::Pointer(v) => {
                let hex: Vec<String> = v.iter().map(|p| format!("{p:#x}")).collect();
                write_items(f, &hex)
            }
        }
    }
}
