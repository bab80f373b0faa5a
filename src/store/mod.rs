//! The shared key-value store ("blackboard") all processes coordinate
//! through. [`KvStore`] is the seam: [`RedisStore`] talks to a real Redis
//! instance, [`MemoryStore`] is an in-process stand-in with the same
//! optimistic-locking semantics, used by tests and embedders.

use std::collections::HashMap;

use thiserror::Error;

use crate::token::ClassId;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Per-class normalizer vectors exchanged through data slots during the
/// distributed normalization.
pub type Normalizers = HashMap<ClassId, Vec<f64>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
    #[error("row {0} is missing from the store")]
    MissingRow(String),
    #[error("value under {key} holds {got} bytes, expected {expected}")]
    Corrupt {
        key: String,
        expected: usize,
        got: usize,
    },
    #[error("value under {0} is not valid UTF-8")]
    NotUtf8(String),
}

/// One connection to the blackboard. Connections are cheap handles opened
/// once per worker thread; none of the methods is re-entrant, which is why
/// they all take `&mut self`.
pub trait KvStore {
    /// Reads `count` floats stored under `key`. A missing row is a fatal
    /// [`StoreError::MissingRow`]: rows are published during initialization,
    /// so absence means mis-sharded data.
    fn get_values(&mut self, key: &str, count: usize) -> Result<Vec<f32>, StoreError>;

    /// Unconditionally writes a float vector under `key`.
    fn set_values(&mut self, key: &str, values: &[f32]) -> Result<(), StoreError>;

    /// Atomic swap: installs `values` and returns what was stored before.
    fn get_set_values(&mut self, key: &str, values: &[f32]) -> Result<Vec<f32>, StoreError>;

    /// Adds `increment` elementwise to the vector under `key` through an
    /// optimistic transaction, retried a bounded number of times. Returns
    /// `Ok(false)` when the retry budget is exhausted; the increment is then
    /// lost and it is the caller's call whether that is tolerable.
    fn increase_values(&mut self, key: &str, increment: &[f32]) -> Result<bool, StoreError>;

    /// Reads a scalar slot. `None` means the slot was never written.
    fn get_value(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a scalar slot.
    fn set_value(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Reads a class-id -> normalizer-vector hashmap; every vector must hold
    /// `count` doubles.
    fn get_hashmap(&mut self, key: &str, count: usize) -> Result<Normalizers, StoreError>;

    /// Replaces the hashmap under `key`.
    fn set_hashmap(&mut self, key: &str, map: &Normalizers) -> Result<(), StoreError>;
}

pub(crate) fn pack_f32s(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn unpack_f32s(key: &str, bytes: &[u8], count: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != count * 4 {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            expected: count * 4,
            got: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

pub(crate) fn pack_f64s(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn unpack_f64s(key: &str, bytes: &[u8], count: usize) -> Result<Vec<f64>, StoreError> {
    if bytes.len() != count * 8 {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            expected: count * 8,
            got: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn float_packing_round_trips() {
        let values = [0.0f32, 1.5, -2.25, f32::MIN_POSITIVE];
        let bytes = pack_f32s(&values);
        assert_eq!(unpack_f32s("k", &bytes, 4).unwrap(), values);

        let doubles = [0.0f64, 1e-300, 42.0];
        let bytes = pack_f64s(&doubles);
        assert_eq!(unpack_f64s("k", &bytes, 3).unwrap(), doubles);
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        let bytes = pack_f32s(&[1.0, 2.0]);
        assert!(matches!(
            unpack_f32s("k", &bytes, 3),
            Err(StoreError::Corrupt { expected: 12, got: 8, .. })
        ));
    }
}
