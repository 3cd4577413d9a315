//! Column types and typed cell values.
//!
//! Values are compared by *type family*: every numeric width compares with
//! every other numeric width, while text, bool and binary only compare within
//! their own family. Comparing across families is an evaluation error rather
//! than a silent mismatch.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// Declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Double,
    String,
    Binary,
}

/// Comparison family a type belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeFamily {
    Bool,
    Numeric,
    Text,
    Binary,
}

impl DataType {
    pub fn family(self) -> TypeFamily {
        match self {
            DataType::Bool => TypeFamily::Bool,
            DataType::Int32 | DataType::Int64 | DataType::Double => TypeFamily::Numeric,
            DataType::String => TypeFamily::Text,
            DataType::Binary => TypeFamily::Binary,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Double => "DOUBLE",
            DataType::String => "STRING",
            DataType::Binary => "BINARY",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single typed cell. `Null` stands for an absent value column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int32(_) => Some(DataType::Int32),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Double(_) => Some(DataType::Double),
            Value::String(_) => Some(DataType::String),
            Value::Binary(_) => Some(DataType::Binary),
        }
    }

    pub fn family(&self) -> Option<TypeFamily> {
        self.data_type().map(DataType::family)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Compare two non-null values of the same family.
    ///
    /// Nulls never reach this point; callers decide null semantics.
    pub fn compare(&self, other: &Value) -> Result<Ordering, EvalError> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Ok(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => Ok(a.total_cmp(b)),
            (Value::Double(a), b) if b.family() == Some(TypeFamily::Numeric) => {
                let b = b.as_int64().ok_or(EvalError::ValuesNotComparable)?;
                Ok(cmp_int_double(b, *a).reverse())
            }
            (a, Value::Double(b)) if a.family() == Some(TypeFamily::Numeric) => {
                let a = a.as_int64().ok_or(EvalError::ValuesNotComparable)?;
                Ok(cmp_int_double(a, *b))
            }
            (a, b) => match (a.as_int64(), b.as_int64()) {
                (Some(a), Some(b)) => Ok(a.cmp(&b)),
                _ => Err(EvalError::ValuesNotComparable),
            },
        }
    }

    /// Convert this value into the representation of `data_type`.
    ///
    /// Integers widen into `Int64`/`Double` columns and narrow into `Int32`
    /// columns when they fit. Returns `None` when the value cannot be stored
    /// in a column of that type. `Null` converts to `Null`.
    pub fn cast(&self, data_type: DataType) -> Option<Value> {
        let cast = match (self, data_type) {
            (Value::Null, _) => Value::Null,
            (Value::Bool(v), DataType::Bool) => Value::Bool(*v),
            (Value::Int32(v), DataType::Int32) => Value::Int32(*v),
            (Value::Int64(v), DataType::Int32) => Value::Int32(i32::try_from(*v).ok()?),
            (Value::Int32(_) | Value::Int64(_), DataType::Int64) => Value::Int64(self.as_int64()?),
            (Value::Int32(_) | Value::Int64(_), DataType::Double) => {
                Value::Double(self.as_int64()? as f64)
            }
            (Value::Double(v), DataType::Double) => Value::Double(*v),
            (Value::String(v), DataType::String) => Value::String(v.clone()),
            (Value::Binary(v), DataType::Binary) => Value::Binary(v.clone()),
            _ => return None,
        };
        Some(cast)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
            Value::Binary(v) => write!(f, "0x{}", hex(v)),
        }
    }
}

/// Exact ordering of an integer against a double, without rounding the
/// integer through `f64`.
fn cmp_int_double(int: i64, double: f64) -> Ordering {
    // 2^63 is exactly representable; every i64 is below it.
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if double.is_nan() {
        return (int as f64).total_cmp(&double);
    }
    if double >= TWO_POW_63 {
        return Ordering::Less;
    }
    if double < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = double.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal if double > whole => Ordering::Less,
        Ordering::Equal if double < whole => Ordering::Greater,
        ord => ord,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
