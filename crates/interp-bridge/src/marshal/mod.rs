//! Value marshalling across the process boundary.
//!
//! Scalars, strings and small collections travel inline. Numeric arrays larger
//! than the inline threshold are written to uniquely named `.npy` files in the
//! spill directory and travel as [`ArrayRef`]s.
//!
//! # File ownership
//!
//! The side that writes a spill file owns it. A `Marshaller` tracks the files
//! it wrote; `release()` deletes specific ones once the peer has consumed them,
//! `cleanup()` deletes all of them, and dropping the marshaller does the same.

mod array;
mod convert;
pub mod npy;
mod value;

pub use array::{ArrayData, DType, Element, NdArray};
pub use convert::{Flatten, Unflatten};
pub use value::{ArrayRef, Value};

use crate::config::{BridgeConfig, SupervisorConfig};
use crate::error::{BridgeError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Converts values to and from their transportable form.
#[derive(Debug)]
pub struct Marshaller {
    inline_threshold: usize,
    spill_dir: PathBuf,
    owned: Mutex<HashSet<PathBuf>>,
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new(
            BridgeConfig::INLINE_THRESHOLD,
            std::env::temp_dir().join(BridgeConfig::SPILL_DIR_NAME),
        )
    }
}

impl Marshaller {
    pub fn new(inline_threshold: usize, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            inline_threshold,
            spill_dir: spill_dir.into(),
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.inline_threshold, config.spill_dir.clone())
    }

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Flatten a native value, spilling any oversized numeric array.
    pub fn flatten<T: Flatten + ?Sized>(&self, value: &T) -> Result<Value> {
        let flat = value.flatten(self)?;
        self.enforce_inline_limit(flat)
    }

    pub fn unflatten<T: Unflatten>(&self, value: Value) -> Result<T> {
        T::unflatten(value, self)
    }

    /// Replace every rectangular numeric list above the threshold with an `ArrayRef`.
    ///
    /// Lists are examined top-down so a large matrix is spilled as one file
    /// rather than one file per row.
    pub fn enforce_inline_limit(&self, value: Value) -> Result<Value> {
        match value {
            Value::List(items) => {
                if let Some(array) = self.oversized_array(&items) {
                    return self.spill(&array).map(Value::ArrayRef);
                }
                items
                    .into_iter()
                    .map(|item| self.enforce_inline_limit(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::List)
            }
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, self.enforce_inline_limit(v)?)))
                .collect::<Result<_>>()
                .map(Value::Map),
            other => Ok(other),
        }
    }

    fn oversized_array(&self, items: &[Value]) -> Option<NdArray> {
        if !matches!(
            items.first(),
            Some(Value::List(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_))
        ) {
            return None;
        }
        NdArray::from_nested(items).filter(|array| array.len() > self.inline_threshold)
    }

    /// Write an array to a fresh spill file owned by this marshaller.
    pub fn spill(&self, array: &NdArray) -> Result<ArrayRef> {
        std::fs::create_dir_all(&self.spill_dir)
            .map_err(|e| BridgeError::io_with_path(e, &self.spill_dir))?;

        let file = tempfile::Builder::new()
            .prefix(BridgeConfig::SPILL_FILE_PREFIX)
            .suffix(BridgeConfig::SPILL_FILE_SUFFIX)
            .tempfile_in(&self.spill_dir)
            .map_err(|e| BridgeError::io_with_path(e, &self.spill_dir))?;
        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| BridgeError::io_with_path(e.error, &self.spill_dir))?;

        self.lock_owned().insert(path.clone());
        if let Err(e) = npy::write(&path, array) {
            self.release([path]);
            return Err(e);
        }

        debug!(
            "Spilled {} array of shape {:?} to {}",
            array.dtype(),
            array.shape(),
            path.display()
        );
        Ok(ArrayRef {
            path,
            dtype: array.dtype().descr().to_string(),
            shape: array.shape().to_vec(),
        })
    }

    /// Load a spilled array, checking it against the reference's dtype and shape.
    pub fn load(&self, reference: &ArrayRef) -> Result<NdArray> {
        let array = npy::read(&reference.path)?;
        let (dtype, _) = DType::parse_descr(&reference.dtype)?;
        if array.dtype() != dtype || array.shape() != reference.shape.as_slice() {
            return Err(BridgeError::marshal(format!(
                "{} holds {} {:?}, reference says {} {:?}",
                reference.path.display(),
                array.dtype(),
                array.shape(),
                reference.dtype,
                reference.shape
            )));
        }
        Ok(array)
    }

    /// Take ownership of every foreign spill file in `value` by copying it.
    ///
    /// The returned tree references only files owned by this marshaller, so
    /// it stays valid after the peer releases its originals.
    pub fn adopt(&self, value: Value) -> Result<Value> {
        match value {
            Value::ArrayRef(reference) => {
                if self.lock_owned().contains(&reference.path) {
                    return Ok(Value::ArrayRef(reference));
                }
                let array = self.load(&reference)?;
                self.spill(&array).map(Value::ArrayRef)
            }
            Value::List(items) => items
                .into_iter()
                .map(|item| self.adopt(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, self.adopt(v)?)))
                .collect::<Result<_>>()
                .map(Value::Map),
            other => Ok(other),
        }
    }

    /// Delete spill files this marshaller owns. Paths it does not own are ignored.
    pub fn release<I>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut owned = self.lock_owned();
        let mut removed = 0;
        for path in paths {
            if owned.remove(&path) {
                remove_spill(&path);
                removed += 1;
            }
        }
        removed
    }

    /// Delete every spill file still owned. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<PathBuf> = self.lock_owned().drain().collect();
        for path in &drained {
            remove_spill(path);
        }
        drained.len()
    }

    pub fn owned_files(&self) -> Vec<PathBuf> {
        self.lock_owned().iter().cloned().collect()
    }

    fn lock_owned(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Marshaller {
    fn drop(&mut self) {
        let removed = self.cleanup();
        if removed > 0 {
            debug!("Removed {} spill files on marshaller drop", removed);
        }
    }
}

fn remove_spill(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove spill file {}: {}", path.display(), e);
        }
    }
}
