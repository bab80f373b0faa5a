use crate::matrix::{PhiMatrix, SpinMutex};
use crate::store::StoreError;
use crate::token::{Token, TokenCollection};

/// In-process matrix: every row is a spinlock-guarded float vector.
///
/// Carries the full [`PhiMatrix`] contract so fits can run without any
/// external store; the store handle passed to its methods is ignored. Tests
/// and the single-process smoke path use this.
pub struct DensePhiMatrix {
    model_name: String,
    num_topics: usize,
    tokens: TokenCollection,
    rows: Vec<SpinMutex<Vec<f32>>>,
}

impl DensePhiMatrix {
    pub fn new(model_name: impl Into<String>, num_topics: usize) -> Self {
        Self {
            model_name: model_name.into(),
            num_topics,
            tokens: TokenCollection::new(),
            rows: Vec::new(),
        }
    }

    /// Row snapshot, mostly for assertions.
    pub fn row(&self, token_id: usize) -> Vec<f32> {
        self.rows[token_id].lock().clone()
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
}

impl<S> PhiMatrix<S> for DensePhiMatrix {
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
        _store: &mut S,
        token: Token,
        publish: bool,
        init_values: &[f32],
    ) -> Result<usize, StoreError> {
        if let Some(existing) = self.tokens.id_of(&token) {
            return Ok(existing);
        }

        let id = self.tokens.add(token);
        let row = if publish {
            init_values.to_vec()
        } else {
            vec![0.0; self.num_topics]
        };
        self.rows.push(SpinMutex::new(row));
        Ok(id)
    }

    fn get(&self, _store: &mut S, token_id: usize, buffer: &mut [f32]) -> Result<(), StoreError> {
        buffer.copy_from_slice(&self.rows[token_id].lock());
        Ok(())
    }

    fn set(&self, _store: &mut S, token_id: usize, values: &[f32]) -> Result<(), StoreError> {
        self.rows[token_id].lock().copy_from_slice(values);
        Ok(())
    }

    fn get_and_set(
        &self,
        _store: &mut S,
        token_id: usize,
        buffer: &mut [f32],
        values: &[f32],
    ) -> Result<(), StoreError> {
        let mut row = self.rows[token_id].lock();
        buffer.copy_from_slice(&row);
        row.copy_from_slice(values);
        Ok(())
    }

    fn increase(
        &self,
        _store: &mut S,
        token_id: usize,
        increment: &[f32],
    ) -> Result<(), StoreError> {
        let mut row = self.rows[token_id].lock();
        for (value, delta) in row.iter_mut().zip(increment) {
            *value += delta;
        }
        Ok(())
    }
}
