use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{pack_f32s, pack_f64s, unpack_f32s, unpack_f64s, KvStore, Normalizers, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Cell {
    version: u64,
    value: Value,
}

/// In-process blackboard sharing one map between all of its clones.
///
/// `increase_values` mirrors the Redis optimistic transaction with a
/// per-key version counter: the commit is refused when another writer
/// bumped the version between read and write, so contention tests exercise
/// the same retry path the Redis client takes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    cells: Arc<Mutex<HashMap<String, Cell>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_bytes(&self, key: &str) -> Option<(u64, Vec<u8>)> {
        let cells = self.cells.lock().unwrap();
        match cells.get(key) {
            Some(Cell {
                version,
                value: Value::Bytes(bytes),
            }) => Some((*version, bytes.clone())),
            _ => None,
        }
    }

    fn write_bytes(&self, key: &str, bytes: Vec<u8>) {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(key.to_string()).or_insert(Cell {
            version: 0,
            value: Value::Bytes(Vec::new()),
        });
        cell.version += 1;
        cell.value = Value::Bytes(bytes);
    }
}

impl KvStore for MemoryStore {
    fn get_values(&mut self, key: &str, count: usize) -> Result<Vec<f32>, StoreError> {
        match self.read_bytes(key) {
            Some((_, bytes)) => unpack_f32s(key, &bytes, count),
            None => Err(StoreError::MissingRow(key.to_string())),
        }
    }

    fn set_values(&mut self, key: &str, values: &[f32]) -> Result<(), StoreError> {
        self.write_bytes(key, pack_f32s(values));
        Ok(())
    }

    fn get_set_values(&mut self, key: &str, values: &[f32]) -> Result<Vec<f32>, StoreError> {
        let mut cells = self.cells.lock().unwrap();
        let Some(cell) = cells.get_mut(key) else {
            return Err(StoreError::MissingRow(key.to_string()));
        };
        let Value::Bytes(bytes) = &mut cell.value else {
            return Err(StoreError::MissingRow(key.to_string()));
        };
        let previous = std::mem::replace(bytes, pack_f32s(values));
        cell.version += 1;
        drop(cells);
        unpack_f32s(key, &previous, values.len())
    }

    fn increase_values(&mut self, key: &str, increment: &[f32]) -> Result<bool, StoreError> {
        for _ in 0..10 {
            let Some((seen_version, bytes)) = self.read_bytes(key) else {
                continue;
            };

            let mut values = unpack_f32s(key, &bytes, increment.len())?;
            for (value, delta) in values.iter_mut().zip(increment) {
                *value += delta;
            }
            let packed = pack_f32s(&values);

            let mut cells = self.cells.lock().unwrap();
            if let Some(cell) = cells.get_mut(key) {
                if cell.version == seen_version {
                    cell.version += 1;
                    cell.value = Value::Bytes(packed);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn get_value(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.read_bytes(key) {
            Some((_, bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::NotUtf8(key.to_string())),
            None => Ok(None),
        }
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write_bytes(key, value.as_bytes().to_vec());
        Ok(())
    }

    fn get_hashmap(&mut self, key: &str, count: usize) -> Result<Normalizers, StoreError> {
        let fields = {
            let cells = self.cells.lock().unwrap();
            match cells.get(key) {
                Some(Cell {
                    value: Value::Hash(fields),
                    ..
                }) => fields.clone(),
                _ => HashMap::new(),
            }
        };

        let mut map = Normalizers::with_capacity(fields.len());
        for (class_id, bytes) in fields {
            map.insert(class_id, unpack_f64s(key, &bytes, count)?);
        }
        Ok(map)
    }

    fn set_hashmap(&mut self, key: &str, map: &Normalizers) -> Result<(), StoreError> {
        let fields = map
            .iter()
            .map(|(class_id, values)| (class_id.clone(), pack_f64s(values)))
            .collect();

        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(key.to_string()).or_insert(Cell {
            version: 0,
            value: Value::Hash(HashMap::new()),
        });
        cell.version += 1;
        cell.value = Value::Hash(fields);
        Ok(())
    }
}
