use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use log::warn;

use crate::matrix::{PhiMatrix, SpinLock};
use crate::store::{KvStore, StoreError};
use crate::token::{Token, TokenCollection};

/// What the matrix keeps in process memory next to the store rows.
///
/// `Read` populates a row cache on `get` and serves repeats from it until
/// [`KvPhiMatrix::clear_read_cache`]; `Write` buffers `increase` calls and
/// emits them on [`KvPhiMatrix::flush`]. Flush points are the caller's
/// business; the executor flushes at batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    None,
    Read,
    Write,
}

/// Matrix whose rows live in the shared store under `<tokenIndex><modelName>`
/// keys. The token collection and the per-row spinlocks are process-local;
/// the row data is shared with every other executor.
pub struct KvPhiMatrix {
    model_name: String,
    num_topics: usize,
    tokens: TokenCollection,
    row_locks: Vec<SpinLock>,
    cache_mode: CacheMode,
    read_cache: RwLock<HashMap<usize, Vec<f32>>>,
    write_cache: Mutex<HashMap<usize, Vec<f32>>>,
}

impl KvPhiMatrix {
    pub fn new(model_name: impl Into<String>, num_topics: usize, cache_mode: CacheMode) -> Self {
        Self {
            model_name: model_name.into(),
            num_topics,
            tokens: TokenCollection::new(),
            row_locks: Vec::new(),
            cache_mode,
            read_cache: RwLock::new(HashMap::new()),
            write_cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, token_id: usize) -> String {
        format!("{token_id}{}", self.model_name)
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn topic_count(&self) -> usize {
        self.num_topics
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, token_id: usize) -> &Token {
        self.tokens.token(token_id)
    }

    pub fn clear_read_cache(&self) {
        self.read_cache.write().unwrap().clear();
    }

    /// Emits every buffered increment through the store's optimistic path.
    /// A row whose retry budget runs out is dropped with a warning, same as
    /// a direct `increase`.
    pub fn flush<S: KvStore>(&self, store: &mut S) -> Result<(), StoreError> {
        let drained: Vec<(usize, Vec<f32>)> = {
            let mut cache = self.write_cache.lock().unwrap();
            cache.drain().collect()
        };

        for (token_id, increment) in drained {
            let key = self.key(token_id);
            let _guard = self.row_locks[token_id].lock();
            if !store.increase_values(&key, &increment)? {
                warn!("update of token data {key} has failed, increment dropped");
            }
        }
        Ok(())
    }
}

impl<S: KvStore> PhiMatrix<S> for KvPhiMatrix {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn topic_count(&self) -> usize {
        self.num_topics
    }

    fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn token(&self, token_id: usize) -> &Token {
        self.tokens.token(token_id)
    }

    fn token_index(&self, token: &Token) -> Option<usize> {
        self.tokens.id_of(token)
    }

    fn add_token(
        &mut self,
        store: &mut S,
        token: Token,
        publish: bool,
        init_values: &[f32],
    ) -> Result<usize, StoreError> {
        if let Some(existing) = self.tokens.id_of(&token) {
            return Ok(existing);
        }

        let id = self.tokens.add(token);
        self.row_locks.push(SpinLock::new(()));
        if publish {
            store.set_values(&self.key(id), init_values)?;
        }
        Ok(id)
    }

    fn get(&self, store: &mut S, token_id: usize, buffer: &mut [f32]) -> Result<(), StoreError> {
        if self.cache_mode == CacheMode::Read {
            if let Some(row) = self.read_cache.read().unwrap().get(&token_id) {
                buffer.copy_from_slice(row);
                return Ok(());
            }
        }

        let values = store.get_values(&self.key(token_id), self.num_topics)?;
        buffer.copy_from_slice(&values);

        if self.cache_mode == CacheMode::Read {
            self.read_cache.write().unwrap().insert(token_id, values);
        }
        Ok(())
    }

    fn set(&self, store: &mut S, token_id: usize, values: &[f32]) -> Result<(), StoreError> {
        let _guard = self.row_locks[token_id].lock();
        store.set_values(&self.key(token_id), values)
    }

    fn get_and_set(
        &self,
        store: &mut S,
        token_id: usize,
        buffer: &mut [f32],
        values: &[f32],
    ) -> Result<(), StoreError> {
        let _guard = self.row_locks[token_id].lock();
        let previous = store.get_set_values(&self.key(token_id), values)?;
        buffer.copy_from_slice(&previous);
        Ok(())
    }

    fn increase(&self, store: &mut S, token_id: usize, increment: &[f32]) -> Result<(), StoreError> {
        if self.cache_mode == CacheMode::Write {
            let mut cache = self.write_cache.lock().unwrap();
            let entry = cache
                .entry(token_id)
                .or_insert_with(|| vec![0.0; self.num_topics]);
            for (value, delta) in entry.iter_mut().zip(increment) {
                *value += delta;
            }
            return Ok(());
        }

        let key = self.key(token_id);
        let _guard = self.row_locks[token_id].lock();
        if !store.increase_values(&key, increment)? {
            warn!("update of token data {key} has failed, increment dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;

    fn published_matrix(cache_mode: CacheMode, store: &mut MemoryStore) -> KvPhiMatrix {
        let mut matrix = KvPhiMatrix::new("pwt", 2, cache_mode);
        matrix
            .add_token(store, Token::plain("a"), true, &[0.5, 0.5])
            .unwrap();
        matrix
            .add_token(store, Token::plain("b"), true, &[1.0, 0.0])
            .unwrap();
        matrix
    }

    #[test]
    fn rows_are_keyed_by_index_and_model_name() {
        let mut store = MemoryStore::new();
        let _matrix = published_matrix(CacheMode::None, &mut store);

        assert_eq!(store.get_values("0pwt", 2).unwrap(), vec![0.5, 0.5]);
        assert_eq!(store.get_values("1pwt", 2).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn add_token_without_publish_writes_nothing() {
        let mut store = MemoryStore::new();
        let mut matrix = KvPhiMatrix::new("nwt", 2, CacheMode::None);
        matrix
            .add_token(&mut store, Token::plain("a"), false, &[9.0, 9.0])
            .unwrap();

        assert!(matches!(
            store.get_values("0nwt", 2),
            Err(StoreError::MissingRow(_))
        ));
    }

    #[test]
    fn add_token_twice_keeps_the_stored_row() {
        let mut store = MemoryStore::new();
        let mut matrix = published_matrix(CacheMode::None, &mut store);

        let id = matrix
            .add_token(&mut store, Token::plain("a"), true, &[9.0, 9.0])
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(store.get_values("0pwt", 2).unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn read_cache_serves_stale_rows_until_cleared() {
        let mut store = MemoryStore::new();
        let matrix = published_matrix(CacheMode::Read, &mut store);

        let mut buffer = [0.0f32; 2];
        matrix.get(&mut store, 0, &mut buffer).unwrap();
        assert_eq!(buffer, [0.5, 0.5]);

        store.set_values("0pwt", &[0.1, 0.9]).unwrap();
        matrix.get(&mut store, 0, &mut buffer).unwrap();
        assert_eq!(buffer, [0.5, 0.5]);

        matrix.clear_read_cache();
        matrix.get(&mut store, 0, &mut buffer).unwrap();
        assert_eq!(buffer, [0.1, 0.9]);
    }

    #[test]
    fn write_cache_defers_increments_until_flush() {
        let mut store = MemoryStore::new();
        let matrix = published_matrix(CacheMode::Write, &mut store);

        matrix.increase(&mut store, 0, &[1.0, 2.0]).unwrap();
        matrix.increase(&mut store, 0, &[1.0, 2.0]).unwrap();
        assert_eq!(store.get_values("0pwt", 2).unwrap(), vec![0.5, 0.5]);

        matrix.flush(&mut store).unwrap();
        assert_eq!(store.get_values("0pwt", 2).unwrap(), vec![2.5, 4.5]);

        // flush drained the buffer, flushing again is a no-op
        matrix.flush(&mut store).unwrap();
        assert_eq!(store.get_values("0pwt", 2).unwrap(), vec![2.5, 4.5]);
    }

    #[test]
    fn direct_increase_lands_immediately() {
        let mut store = MemoryStore::new();
        let matrix = published_matrix(CacheMode::None, &mut store);

        matrix.increase(&mut store, 1, &[0.5, 1.5]).unwrap();
        assert_eq!(store.get_values("1pwt", 2).unwrap(), vec![1.5, 1.5]);
    }
}
