//! Conversions between native Rust values and [`Value`].

use super::array::NdArray;
use super::value::Value;
use super::Marshaller;
use crate::error::{BridgeError, Result};
use std::collections::{BTreeMap, HashMap};

/// Convert a native value into its transportable form.
pub trait Flatten {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value>;
}

/// Rebuild a native value from its transportable form.
pub trait Unflatten: Sized {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self>;
}

fn mismatch<T>(expected: &str, got: &Value) -> Result<T> {
    Err(BridgeError::marshal(format!(
        "expected {}, got {}",
        expected,
        got.kind()
    )))
}

impl<T: Flatten + ?Sized> Flatten for &T {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        (**self).flatten(marshaller)
    }
}

impl<T: Flatten + ?Sized> Flatten for Box<T> {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        (**self).flatten(marshaller)
    }
}

impl Flatten for Value {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(self.clone())
    }
}

impl Unflatten for Value {
    fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
        Ok(value)
    }
}

impl Flatten for () {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl Unflatten for () {
    fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
        match value {
            Value::Null => Ok(()),
            other => mismatch("null", &other),
        }
    }
}

impl Flatten for bool {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::Bool(*self))
    }
}

impl Unflatten for bool {
    fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

macro_rules! impl_int {
    ($($t:ty),*) => {$(
        impl Flatten for $t {
            fn flatten(&self, _: &Marshaller) -> Result<Value> {
                i64::try_from(*self)
                    .map(Value::Int)
                    .map_err(|_| BridgeError::marshal(format!("{} does not fit in i64", self)))
            }
        }

        impl Unflatten for $t {
            fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
                match value {
                    Value::Int(i) => <$t>::try_from(i).map_err(|_| {
                        BridgeError::marshal(format!(
                            "{} is out of range for {}",
                            i,
                            stringify!($t)
                        ))
                    }),
                    other => mismatch(stringify!($t), &other),
                }
            }
        }
    )*};
}

impl_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl Flatten for f64 {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::Float(*self))
    }
}

impl Unflatten for f64 {
    fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            other => mismatch("float", &other),
        }
    }
}

impl Flatten for f32 {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::Float(f64::from(*self)))
    }
}

impl Unflatten for f32 {
    fn unflatten(value: Value, m: &Marshaller) -> Result<Self> {
        f64::unflatten(value, m).map(|f| f as f32)
    }
}

impl Flatten for str {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::String(self.to_string()))
    }
}

impl Flatten for String {
    fn flatten(&self, _: &Marshaller) -> Result<Value> {
        Ok(Value::String(self.clone()))
    }
}

impl Unflatten for String {
    fn unflatten(value: Value, _: &Marshaller) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl<T: Flatten> Flatten for Option<T> {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        match self {
            Some(v) => v.flatten(marshaller),
            None => Ok(Value::Null),
        }
    }
}

impl<T: Unflatten> Unflatten for Option<T> {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::unflatten(other, marshaller).map(Some),
        }
    }
}

impl<T: Flatten> Flatten for [T] {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        self.iter()
            .map(|item| item.flatten(marshaller))
            .collect::<Result<Vec<_>>>()
            .map(Value::List)
    }
}

impl<T: Flatten> Flatten for Vec<T> {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        self.as_slice().flatten(marshaller)
    }
}

impl<T: Unflatten> Unflatten for Vec<T> {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self> {
        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| T::unflatten(item, marshaller))
                .collect(),
            Value::ArrayRef(r) => {
                let expanded = marshaller.load(&r)?.to_value();
                Self::unflatten(expanded, marshaller)
            }
            other => mismatch("list", &other),
        }
    }
}

impl<T: Flatten> Flatten for HashMap<String, T> {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), v.flatten(marshaller)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Value::Map)
    }
}

impl<T: Unflatten> Unflatten for HashMap<String, T> {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, T::unflatten(v, marshaller)?)))
                .collect(),
            other => mismatch("map", &other),
        }
    }
}

impl<T: Flatten> Flatten for BTreeMap<String, T> {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), v.flatten(marshaller)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Value::Map)
    }
}

impl<T: Unflatten> Unflatten for BTreeMap<String, T> {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, T::unflatten(v, marshaller)?)))
                .collect(),
            other => mismatch("map", &other),
        }
    }
}

impl Flatten for NdArray {
    fn flatten(&self, marshaller: &Marshaller) -> Result<Value> {
        if self.len() > marshaller.inline_threshold() {
            marshaller.spill(self).map(Value::ArrayRef)
        } else {
            Ok(self.to_value())
        }
    }
}

impl Unflatten for NdArray {
    fn unflatten(value: Value, marshaller: &Marshaller) -> Result<Self> {
        match value {
            Value::ArrayRef(r) => marshaller.load(&r),
            Value::List(items) => NdArray::from_nested(&items).ok_or_else(|| {
                BridgeError::marshal("list is not a rectangular numeric array")
            }),
            other => mismatch("ndarray", &other),
        }
    }
}
