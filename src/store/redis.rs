use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use redis::{Commands, Connection};

use super::{pack_f32s, pack_f64s, unpack_f32s, unpack_f64s, KvStore, Normalizers, StoreError};

/// Blackboard client backed by a Redis connection.
///
/// `increase_values` runs the classic WATCH / GET / MULTI-SET / EXEC
/// optimistic transaction; a concurrent writer aborts the EXEC and the
/// attempt is retried up to `max_retries` times.
pub struct RedisStore {
    connection: Connection,
    max_retries: usize,
}

impl RedisStore {
    pub fn connect(
        host: &str,
        port: u16,
        max_retries: usize,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open((host, port))?;
        let connection = client.get_connection_with_timeout(timeout)?;
        debug!("connected to redis at {host}:{port}");
        Ok(Self {
            connection,
            max_retries,
        })
    }
}

impl KvStore for RedisStore {
    fn get_values(&mut self, key: &str, count: usize) -> Result<Vec<f32>, StoreError> {
        let bytes: Option<Vec<u8>> = self.connection.get(key)?;
        match bytes {
            Some(bytes) => unpack_f32s(key, &bytes, count),
            None => Err(StoreError::MissingRow(key.to_string())),
        }
    }

    fn set_values(&mut self, key: &str, values: &[f32]) -> Result<(), StoreError> {
        let _: () = self.connection.set(key, pack_f32s(values))?;
        Ok(())
    }

    fn get_set_values(&mut self, key: &str, values: &[f32]) -> Result<Vec<f32>, StoreError> {
        let bytes: Option<Vec<u8>> = self.connection.getset(key, pack_f32s(values))?;
        match bytes {
            Some(bytes) => unpack_f32s(key, &bytes, values.len()),
            None => Err(StoreError::MissingRow(key.to_string())),
        }
    }

    fn increase_values(&mut self, key: &str, increment: &[f32]) -> Result<bool, StoreError> {
        for _ in 0..self.max_retries {
            let _: () = redis::cmd("WATCH").arg(key).query(&mut self.connection)?;

            let bytes: Option<Vec<u8>> = self.connection.get(key)?;
            let Some(bytes) = bytes else {
                let _: () = redis::cmd("UNWATCH").query(&mut self.connection)?;
                continue;
            };

            let mut values = unpack_f32s(key, &bytes, increment.len())?;
            for (value, delta) in values.iter_mut().zip(increment) {
                *value += delta;
            }

            // EXEC returns nil when the watched key moved under us.
            let committed: Option<()> = redis::pipe()
                .atomic()
                .set(key, pack_f32s(&values))
                .ignore()
                .query(&mut self.connection)?;

            if committed.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn get_value(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let bytes: Option<Vec<u8>> = self.connection.get(key)?;
        match bytes {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::NotUtf8(key.to_string())),
            None => Ok(None),
        }
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: () = self.connection.set(key, value)?;
        Ok(())
    }

    fn get_hashmap(&mut self, key: &str, count: usize) -> Result<Normalizers, StoreError> {
        let fields: HashMap<String, Vec<u8>> = self.connection.hgetall(key)?;
        let mut map = Normalizers::with_capacity(fields.len());
        for (class_id, bytes) in fields {
            let values = unpack_f64s(key, &bytes, count)?;
            map.insert(class_id, values);
        }
        Ok(map)
    }

    fn set_hashmap(&mut self, key: &str, map: &Normalizers) -> Result<(), StoreError> {
        let fields: Vec<(String, Vec<u8>)> = map
            .iter()
            .map(|(class_id, values)| (class_id.clone(), pack_f64s(values)))
            .collect();

        let _: () = self.connection.del(key)?;
        if !fields.is_empty() {
            let _: () = self.connection.hset_multiple(key, &fields)?;
        }
        Ok(())
    }
}
