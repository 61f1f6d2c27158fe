//! Type-coded scalar storage backing shared arrays and values.

use crate::error::{PoolError, SyncError};

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element type of a shared array or value, named by its one-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeCode {
  /// `b`
  SignedChar,
  /// `B`
  UnsignedChar,
  /// `u`
  Unicode,
  /// `h`
  SignedShort,
  /// `H`
  UnsignedShort,
  /// `i`
  SignedInt,
  /// `I`
  UnsignedInt,
  /// `l`
  SignedLong,
  /// `L`
  UnsignedLong,
  /// `q`
  SignedLongLong,
  /// `Q`
  UnsignedLongLong,
  /// `f`
  Float,
  /// `d`
  Double,
}

impl TypeCode {
  pub const ALL: [TypeCode; 13] = [
    TypeCode::SignedChar,
    TypeCode::UnsignedChar,
    TypeCode::Unicode,
    TypeCode::SignedShort,
    TypeCode::UnsignedShort,
    TypeCode::SignedInt,
    TypeCode::UnsignedInt,
    TypeCode::SignedLong,
    TypeCode::UnsignedLong,
    TypeCode::SignedLongLong,
    TypeCode::UnsignedLongLong,
    TypeCode::Float,
    TypeCode::Double,
  ];

  pub fn code(&self) -> char {
    match self {
      TypeCode::SignedChar => 'b',
      TypeCode::UnsignedChar => 'B',
      TypeCode::Unicode => 'u',
      TypeCode::SignedShort => 'h',
      TypeCode::UnsignedShort => 'H',
      TypeCode::SignedInt => 'i',
      TypeCode::UnsignedInt => 'I',
      TypeCode::SignedLong => 'l',
      TypeCode::UnsignedLong => 'L',
      TypeCode::SignedLongLong => 'q',
      TypeCode::UnsignedLongLong => 'Q',
      TypeCode::Float => 'f',
      TypeCode::Double => 'd',
    }
  }

  fn signed_range(&self) -> Option<(i64, i64)> {
    match self {
      TypeCode::SignedChar => Some((i8::MIN.into(), i8::MAX.into())),
      TypeCode::SignedShort => Some((i16::MIN.into(), i16::MAX.into())),
      TypeCode::SignedInt => Some((i32::MIN.into(), i32::MAX.into())),
      TypeCode::SignedLong | TypeCode::SignedLongLong => Some((i64::MIN, i64::MAX)),
      _ => None,
    }
  }

  fn unsigned_max(&self) -> Option<u64> {
    match self {
      TypeCode::UnsignedChar => Some(u8::MAX.into()),
      TypeCode::UnsignedShort => Some(u16::MAX.into()),
      TypeCode::UnsignedInt => Some(u32::MAX.into()),
      TypeCode::UnsignedLong | TypeCode::UnsignedLongLong => Some(u64::MAX),
      _ => None,
    }
  }

  /// Checks that `value` is representable under this code.
  pub fn check(&self, value: &Value) -> Result<(), SyncError> {
    let fits = if let Some((min, max)) = self.signed_range() {
      value.as_i64().is_some_and(|v| v >= min && v <= max)
    } else if let Some(max) = self.unsigned_max() {
      value.as_u64().is_some_and(|v| v <= max)
    } else {
      match self {
        TypeCode::Unicode => value.as_str().is_some_and(|s| s.chars().count() == 1),
        TypeCode::Float => value.as_f64().is_some_and(|v| v.abs() <= f64::from(f32::MAX)),
        _ => value.is_number(),
      }
    };
    if fits {
      Ok(())
    } else {
      Err(SyncError::TypeMismatch {
        code: self.code(),
        value: value.to_string(),
      })
    }
  }
}

impl fmt::Display for TypeCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.code())
  }
}

impl FromStr for TypeCode {
  type Err = PoolError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut chars = s.chars();
    let found = match (chars.next(), chars.next()) {
      (Some(c), None) => TypeCode::ALL.into_iter().find(|code| code.code() == c),
      _ => None,
    };
    found.ok_or_else(|| {
      PoolError::InvalidArgument(format!(
        "unknown type code `{}` (expected one of bBuhHiIlLqQfd)",
        s
      ))
    })
  }
}

/// A fixed-length array whose elements are checked against a type code.
#[derive(Debug)]
pub(crate) struct TypedArray {
  code: TypeCode,
  items: Mutex<Vec<Value>>,
}

impl TypedArray {
  pub(crate) fn new(code: TypeCode, items: Vec<Value>) -> Result<Self, SyncError> {
    for item in &items {
      code.check(item)?;
    }
    Ok(Self {
      code,
      items: Mutex::new(items),
    })
  }

  pub(crate) fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub(crate) fn get(&self, index: usize) -> Result<Value, SyncError> {
    let items = self.items.lock();
    items.get(index).cloned().ok_or(SyncError::IndexOutOfRange {
      index,
      len: items.len(),
    })
  }

  pub(crate) fn set(&self, index: usize, value: Value) -> Result<(), SyncError> {
    self.code.check(&value)?;
    let mut items = self.items.lock();
    let len = items.len();
    match items.get_mut(index) {
      Some(slot) => {
        *slot = value;
        Ok(())
      }
      None => Err(SyncError::IndexOutOfRange { index, len }),
    }
  }

  pub(crate) fn snapshot(&self) -> Vec<Value> {
    self.items.lock().clone()
  }
}

/// A single type-checked scalar.
#[derive(Debug)]
pub(crate) struct TypedCell {
  code: TypeCode,
  value: Mutex<Value>,
}

impl TypedCell {
  pub(crate) fn new(code: TypeCode, value: Value) -> Result<Self, SyncError> {
    code.check(&value)?;
    Ok(Self {
      code,
      value: Mutex::new(value),
    })
  }

  pub(crate) fn get(&self) -> Value {
    self.value.lock().clone()
  }

  pub(crate) fn set(&self, value: Value) -> Result<(), SyncError> {
    self.code.check(&value)?;
    *self.value.lock() = value;
    Ok(())
  }
}
