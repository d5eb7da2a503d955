//! Transportable value model and its JSON wire encoding.
//!
//! Plain JSON covers most variants directly. The rest use single-key tag
//! objects:
//!
//! ```text
//! {"__ndarray__": {"path": "...", "dtype": "<f8", "shape": [2, 3]}}
//! {"__float__": "nan" | "inf" | "-inf"}
//! {"__map__": {...}}     // a user map whose only key collides with a tag
//! ```

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

const TAG_NDARRAY: &str = "__ndarray__";
const TAG_FLOAT: &str = "__float__";
const TAG_MAP: &str = "__map__";

/// Whether `n` was written without a fraction or exponent.
fn is_integer_literal(n: &serde_json::Number) -> bool {
    !n.to_string().contains(|c| matches!(c, '.' | 'e' | 'E'))
}

fn is_reserved_tag(key: &str) -> bool {
    matches!(key, TAG_NDARRAY | TAG_FLOAT | TAG_MAP)
}

/// Reference to a numeric array spilled to a `.npy` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayRef {
    pub path: PathBuf,
    /// NumPy type descriptor, e.g. `<f8`.
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl ArrayRef {
    /// Elements named by `shape`, saturating at `usize::MAX`.
    pub fn element_count(&self) -> usize {
        super::array::element_count(&self.shape).unwrap_or(usize::MAX)
    }
}

/// A value that can cross the process boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    ArrayRef(ArrayRef),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::ArrayRef(_) => "ndarray",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Collect the paths of every `ArrayRef` in this tree.
    pub fn collect_array_paths(&self, out: &mut Vec<PathBuf>) {
        match self {
            Value::ArrayRef(r) => out.push(r.path.clone()),
            Value::List(items) => items.iter().for_each(|v| v.collect_array_paths(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_array_paths(out)),
            _ => {}
        }
    }

    pub fn array_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.collect_array_paths(&mut out);
        out
    }

    /// Encode into the JSON wire form.
    pub fn to_wire(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => J::Number(n),
                None => {
                    let tag = if f.is_nan() {
                        "nan"
                    } else if *f > 0.0 {
                        "inf"
                    } else {
                        "-inf"
                    };
                    tagged(TAG_FLOAT, J::String(tag.to_string()))
                }
            },
            Value::String(s) => J::String(s.clone()),
            Value::List(items) => J::Array(items.iter().map(Value::to_wire).collect()),
            Value::Map(map) => {
                let obj: serde_json::Map<String, J> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_wire()))
                    .collect();
                let needs_escape = obj.len() == 1 && obj.keys().all(|k| is_reserved_tag(k));
                if needs_escape {
                    tagged(TAG_MAP, J::Object(obj))
                } else {
                    J::Object(obj)
                }
            }
            Value::ArrayRef(r) => tagged(
                TAG_NDARRAY,
                serde_json::json!({
                    "path": r.path.to_string_lossy(),
                    "dtype": r.dtype,
                    "shape": r.shape,
                }),
            ),
        }
    }

    /// Decode from the JSON wire form.
    pub fn from_wire(json: serde_json::Value) -> Result<Self> {
        use serde_json::Value as J;
        Ok(match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() || is_integer_literal(&n) {
                    return Err(BridgeError::marshal(format!(
                        "integer {} does not fit in a signed 64-bit value",
                        n
                    )));
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            J::String(s) => Value::String(s),
            J::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_wire)
                    .collect::<Result<Vec<_>>>()?,
            ),
            J::Object(obj) => {
                if obj.len() == 1 {
                    if let Some((key, inner)) = obj.iter().next() {
                        if is_reserved_tag(key) {
                            return decode_tagged(key, inner.clone());
                        }
                    }
                }
                Value::Map(decode_map(obj)?)
            }
        })
    }
}

fn tagged(tag: &str, inner: serde_json::Value) -> serde_json::Value {
    let mut obj = serde_json::Map::with_capacity(1);
    obj.insert(tag.to_string(), inner);
    serde_json::Value::Object(obj)
}

fn decode_map(obj: serde_json::Map<String, serde_json::Value>) -> Result<BTreeMap<String, Value>> {
    obj.into_iter()
        .map(|(k, v)| Ok((k, Value::from_wire(v)?)))
        .collect()
}

fn decode_tagged(tag: &str, inner: serde_json::Value) -> Result<Value> {
    match tag {
        TAG_NDARRAY => {
            let r: ArrayRef = serde_json::from_value(inner)
                .map_err(|e| BridgeError::marshal(format!("malformed array reference: {}", e)))?;
            Ok(Value::ArrayRef(r))
        }
        TAG_FLOAT => match inner.as_str() {
            Some("nan") => Ok(Value::Float(f64::NAN)),
            Some("inf") => Ok(Value::Float(f64::INFINITY)),
            Some("-inf") => Ok(Value::Float(f64::NEG_INFINITY)),
            other => Err(BridgeError::marshal(format!(
                "unknown float tag {:?}",
                other
            ))),
        },
        _ => match inner {
            serde_json::Value::Object(obj) => Ok(Value::Map(decode_map(obj)?)),
            other => Err(BridgeError::marshal(format!(
                "escaped map must wrap an object, got {}",
                other
            ))),
        },
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_wire(json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}
