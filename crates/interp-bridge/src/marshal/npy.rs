//! NumPy `.npy` encoding used for spilled arrays.
//!
//! ```text
//! \x93NUMPY <major> <minor> <header len: u16 LE (v1) | u32 LE (v2/v3)>
//! {'descr': '<f8', 'fortran_order': False, 'shape': (2, 3), }   padded to 64 bytes
//! <raw C-order element bytes>
//! ```

use super::array::{element_count, ArrayData, DType, NdArray};
use crate::error::{BridgeError, Result};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGN: usize = 64;

/// Encode an array as a version 1.0 `.npy` image.
pub fn encode(array: &NdArray) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        array.dtype().descr(),
        shape_literal(array.shape())
    );
    // magic(6) + version(2) + len(2) + header + '\n'
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let body = array.data().to_le_bytes();
    let mut out = Vec::with_capacity(unpadded + padding + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a `.npy` image.
pub fn decode(bytes: &[u8]) -> Result<NdArray> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(BridgeError::marshal("not an .npy file (bad magic)"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(BridgeError::marshal("truncated .npy header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        other => {
            return Err(BridgeError::marshal(format!(
                "unsupported .npy version {}",
                other
            )))
        }
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(BridgeError::marshal("truncated .npy header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| BridgeError::marshal("non-UTF-8 .npy header"))?;
    let parsed = parse_header(header)?;
    if parsed.fortran_order {
        return Err(BridgeError::marshal(
            "Fortran-ordered arrays are not supported",
        ));
    }

    let (dtype, big_endian) = DType::parse_descr(&parsed.descr)?;
    let body_len = element_count(&parsed.shape)
        .and_then(|count| count.checked_mul(dtype.item_size()))
        .ok_or_else(|| {
            BridgeError::marshal(format!(".npy shape {:?} is too large", parsed.shape))
        })?;
    let body = data_start
        .checked_add(body_len)
        .and_then(|end| bytes.get(data_start..end))
        .ok_or_else(|| {
            BridgeError::marshal(format!(
                ".npy body holds {} bytes, expected {}",
                bytes.len() - data_start,
                body_len
            ))
        })?;
    let data = ArrayData::from_bytes(dtype, body, big_endian)?;
    NdArray::new(parsed.shape, data)
}

pub fn write(path: &Path, array: &NdArray) -> Result<()> {
    std::fs::write(path, encode(array)).map_err(|e| BridgeError::io_with_path(e, path))
}

pub fn read(path: &Path) -> Result<NdArray> {
    let bytes = std::fs::read(path).map_err(|e| BridgeError::io_with_path(e, path))?;
    decode(&bytes)
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[derive(Debug)]
struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Parse the Python dict literal written by NumPy.
fn parse_header(header: &str) -> Result<Header> {
    let descr = value_after(header, "descr")
        .and_then(|rest| {
            let quote = rest.chars().next()?;
            if quote != '\'' && quote != '"' {
                return None;
            }
            let inner = &rest[1..];
            inner.find(quote).map(|end| inner[..end].to_string())
        })
        .ok_or_else(|| BridgeError::marshal(format!("missing descr in header {:?}", header)))?;

    let fortran_order = value_after(header, "fortran_order")
        .map(|rest| rest.starts_with("True"))
        .unwrap_or(false);

    let shape_src = value_after(header, "shape")
        .and_then(|rest| {
            let rest = rest.strip_prefix('(')?;
            rest.find(')').map(|end| &rest[..end])
        })
        .ok_or_else(|| BridgeError::marshal(format!("missing shape in header {:?}", header)))?;
    let shape = shape_src
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| BridgeError::marshal(format!("bad shape dimension {:?}", s)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Text following `'key':` with leading whitespace removed.
fn value_after<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    for quoted in [format!("'{}'", key), format!("\"{}\"", key)] {
        if let Some(pos) = header.find(&quoted) {
            let rest = header[pos + quoted.len()..].trim_start();
            return rest.strip_prefix(':').map(str::trim_start);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_aligned() {
        let arr = NdArray::from_vec(vec![1.0f64, 2.0, 3.0]);
        let bytes = encode(&arr);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(bytes.len(), 10 + header_len + 24);
    }

    #[test]
    fn test_encode_decode_preserves_bits() {
        let arr = NdArray::from_shape_vec(vec![2, 2], vec![f32::MIN, -0.0, 1.5, f32::NAN]).unwrap();
        let decoded = decode(&encode(&arr)).unwrap();
        assert_eq!(decoded, arr);
        assert_eq!(decoded.shape(), &[2, 2]);
    }

    #[test]
    fn test_decode_numpy_written_header() {
        // Header layout as produced by numpy.save for a big-endian int16 vector
        let header = "{'descr': '>i2', 'fortran_order': False, 'shape': (3,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        let mut padded = header.to_string();
        while (10 + padded.len() + 1) % 64 != 0 {
            padded.push(' ');
        }
        padded.push('\n');
        bytes.extend_from_slice(&(padded.len() as u16).to_le_bytes());
        bytes.extend_from_slice(padded.as_bytes());
        for v in [1i16, -1, 256] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }

        let arr = decode(&bytes).unwrap();
        assert_eq!(arr.as_slice::<i16>().unwrap(), &[1, -1, 256]);
    }

    #[test]
    fn test_scalar_shape_literal() {
        assert_eq!(shape_literal(&[]), "()");
        assert_eq!(shape_literal(&[4]), "(4,)");
        assert_eq!(shape_literal(&[2, 3]), "(2, 3)");
    }

    #[test]
    fn test_truncated_body_is_error() {
        let arr = NdArray::from_vec(vec![1i64, 2, 3]);
        let mut bytes = encode(&arr);
        bytes.truncate(bytes.len() - 4);
        assert!(decode(&bytes).is_err());
    }

    fn image_with_header(header: &str) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out
    }

    #[test]
    fn test_oversized_shape_is_error() {
        let bytes = image_with_header(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (4611686018427387904, 8), }\n",
        );
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let bytes = image_with_header(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (2305843009213693951,), }\n",
        );
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_fortran_order_rejected() {
        let header = parse_header("{'descr': '<f8', 'fortran_order': True, 'shape': (2, 2), }")
            .unwrap();
        assert!(header.fortran_order);
        assert_eq!(header.shape, vec![2, 2]);
    }
}
