//! Native n-dimensional numeric arrays.

use super::value::Value;
use crate::error::{BridgeError, Result};

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Little-endian NumPy descriptor.
    pub fn descr(&self) -> &'static str {
        match self {
            DType::Bool => "|b1",
            DType::U8 => "|u1",
            DType::U16 => "<u2",
            DType::U32 => "<u4",
            DType::U64 => "<u8",
            DType::I8 => "|i1",
            DType::I16 => "<i2",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    pub fn item_size(&self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// Parse a NumPy descriptor. Returns the dtype and whether it is big-endian.
    pub fn parse_descr(descr: &str) -> Result<(DType, bool)> {
        let (order, code) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
            _ => ('=', descr),
        };
        let dtype = match code {
            "b1" | "?" => DType::Bool,
            "u1" => DType::U8,
            "u2" => DType::U16,
            "u4" => DType::U32,
            "u8" => DType::U64,
            "i1" => DType::I8,
            "i2" => DType::I16,
            "i4" => DType::I32,
            "i8" => DType::I64,
            "f4" => DType::F32,
            "f8" => DType::F64,
            _ => {
                return Err(BridgeError::marshal(format!(
                    "unsupported array dtype '{}'",
                    descr
                )))
            }
        };
        let big_endian = order == '>' || (order == '=' && cfg!(target_endian = "big"));
        Ok((dtype, big_endian && dtype.item_size() > 1))
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.descr())
    }
}

/// Typed element storage.
#[derive(Debug, Clone)]
pub enum ArrayData {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! for_numeric_variants {
    ($m:ident) => {
        $m!(U8, u8);
        $m!(U16, u16);
        $m!(U32, u32);
        $m!(U64, u64);
        $m!(I8, i8);
        $m!(I16, i16);
        $m!(I32, i32);
        $m!(I64, i64);
        $m!(F32, f32);
        $m!(F64, f64);
    };
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::U8(_) => DType::U8,
            ArrayData::U16(_) => DType::U16,
            ArrayData::U32(_) => DType::U32,
            ArrayData::U64(_) => DType::U64,
            ArrayData::I8(_) => DType::I8,
            ArrayData::I16(_) => DType::I16,
            ArrayData::I32(_) => DType::I32,
            ArrayData::I64(_) => DType::I64,
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bool(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::U16(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian element bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        macro_rules! le {
            ($variant:ident, $t:ty) => {
                if let ArrayData::$variant(v) = self {
                    return v.iter().flat_map(|x| x.to_le_bytes()).collect();
                }
            };
        }
        if let ArrayData::Bool(v) = self {
            return v.iter().map(|b| u8::from(*b)).collect();
        }
        for_numeric_variants!(le);
        Vec::new()
    }

    /// Rebuild typed storage from raw element bytes.
    pub fn from_bytes(dtype: DType, bytes: &[u8], big_endian: bool) -> Result<Self> {
        let size = dtype.item_size();
        if bytes.len() % size != 0 {
            return Err(BridgeError::marshal(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        macro_rules! decode {
            ($variant:ident, $t:ty) => {
                if dtype == DType::$variant {
                    let values = bytes
                        .chunks_exact(std::mem::size_of::<$t>())
                        .map(|chunk| {
                            let mut raw = [0u8; std::mem::size_of::<$t>()];
                            raw.copy_from_slice(chunk);
                            if big_endian {
                                <$t>::from_be_bytes(raw)
                            } else {
                                <$t>::from_le_bytes(raw)
                            }
                        })
                        .collect();
                    return Ok(ArrayData::$variant(values));
                }
            };
        }
        if dtype == DType::Bool {
            return Ok(ArrayData::Bool(bytes.iter().map(|b| *b != 0).collect()));
        }
        for_numeric_variants!(decode);
        Err(BridgeError::marshal(format!("cannot decode dtype {}", dtype)))
    }

    fn element(&self, index: usize) -> Value {
        match self {
            ArrayData::Bool(v) => Value::Bool(v[index]),
            ArrayData::U8(v) => Value::Int(i64::from(v[index])),
            ArrayData::U16(v) => Value::Int(i64::from(v[index])),
            ArrayData::U32(v) => Value::Int(i64::from(v[index])),
            ArrayData::U64(v) => match i64::try_from(v[index]) {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Float(v[index] as f64),
            },
            ArrayData::I8(v) => Value::Int(i64::from(v[index])),
            ArrayData::I16(v) => Value::Int(i64::from(v[index])),
            ArrayData::I32(v) => Value::Int(i64::from(v[index])),
            ArrayData::I64(v) => Value::Int(v[index]),
            ArrayData::F32(v) => Value::Float(f64::from(v[index])),
            ArrayData::F64(v) => Value::Float(v[index]),
        }
    }
}

/// Element types that can back an [`NdArray`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
    fn wrap(values: Vec<Self>) -> ArrayData;
    fn slice(data: &ArrayData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($variant:ident, $t:ty) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn wrap(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn slice(data: &ArrayData) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(Bool, bool);
for_numeric_variants!(impl_element);

/// A C-ordered n-dimensional array.
///
/// Equality is bit-for-bit: two float arrays holding the same NaN payloads
/// compare equal, `0.0` and `-0.0` do not.
#[derive(Debug, Clone)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let expected = element_count(&shape).ok_or_else(|| {
            BridgeError::marshal(format!("shape {:?} overflows the element count", shape))
        })?;
        if expected != data.len() {
            return Err(BridgeError::marshal(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array over `values`.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        Self {
            shape: vec![values.len()],
            data: T::wrap(values),
        }
    }

    pub fn from_shape_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(values))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// Expand into nested `Value::List`s following the shape.
    pub fn to_value(&self) -> Value {
        if self.shape.is_empty() {
            return self.data.element(0);
        }
        let mut offset = 0;
        self.nest(0, &mut offset)
    }

    fn nest(&self, axis: usize, offset: &mut usize) -> Value {
        let extent = self.shape[axis];
        if axis + 1 == self.shape.len() {
            let items = (0..extent).map(|i| self.data.element(*offset + i)).collect();
            *offset += extent;
            Value::List(items)
        } else {
            Value::List((0..extent).map(|_| self.nest(axis + 1, offset)).collect())
        }
    }

    /// Infer an array from a rectangular nested list of numbers.
    ///
    /// All-bool lists become `Bool`, all-int lists `I64`, any float makes the
    /// whole array `F64`. Returns `None` for ragged or non-numeric input, and
    /// for mixed lists holding an int that `f64` cannot represent exactly.
    pub fn from_nested(items: &[Value]) -> Option<NdArray> {
        let mut shape = Vec::new();
        let mut level = items;
        shape.push(level.len());
        while let Some(Value::List(inner)) = level.first() {
            shape.push(inner.len());
            level = inner;
        }

        let mut flat = Vec::new();
        if !collect_rectangular(items, &shape, 0, &mut flat) {
            return None;
        }

        let all_bool = flat.iter().all(|v| matches!(v, Value::Bool(_)));
        let all_int = flat.iter().all(|v| matches!(v, Value::Int(_)));
        let all_numeric = flat
            .iter()
            .all(|v| matches!(v, Value::Int(_) | Value::Float(_)));

        let data = if flat.is_empty() {
            ArrayData::F64(Vec::new())
        } else if all_bool {
            ArrayData::Bool(flat.iter().filter_map(|v| v.as_bool()).collect())
        } else if all_int {
            ArrayData::I64(flat.iter().filter_map(|v| v.as_i64()).collect())
        } else if all_numeric {
            if flat.iter().any(|v| matches!(v, Value::Int(i) if !exact_in_f64(*i))) {
                return None;
            }
            ArrayData::F64(flat.iter().filter_map(|v| v.as_f64()).collect())
        } else {
            return None;
        };
        Some(NdArray { shape, data })
    }
}

/// Product of `shape`, or `None` on overflow.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Largest magnitude below which every integer has an exact `f64`.
const F64_EXACT_INT: u64 = 1 << 53;

fn exact_in_f64(value: i64) -> bool {
    value.unsigned_abs() <= F64_EXACT_INT
}

fn collect_rectangular<'a>(
    items: &'a [Value],
    shape: &[usize],
    axis: usize,
    flat: &mut Vec<&'a Value>,
) -> bool {
    if items.len() != shape[axis] {
        return false;
    }
    let leaf = axis + 1 == shape.len();
    for item in items {
        match (leaf, item) {
            (false, Value::List(inner)) => {
                if !collect_rectangular(inner, shape, axis + 1, flat) {
                    return false;
                }
            }
            (true, Value::Bool(_) | Value::Int(_) | Value::Float(_)) => flat.push(item),
            _ => return false,
        }
    }
    true
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.dtype() == other.dtype()
            && self.data.to_le_bytes() == other.data.to_le_bytes()
    }
}
