//! Word-topic matrices with an expanding row set.
//!
//! [`PhiMatrix`] is the one interface both the E-step and the normalization
//! passes program against; [`DensePhiMatrix`] keeps rows in process memory,
//! [`KvPhiMatrix`] keeps them in the shared store. The store handle type is
//! a trait parameter so dense matrices work with any store (including `()`)
//! while the KV matrix requires a real [`crate::store::KvStore`].

mod dense;
mod kv;
mod spin;

pub use dense::DensePhiMatrix;
pub use kv::{CacheMode, KvPhiMatrix};
pub use spin::{SpinLock, SpinMutex};

use crate::store::StoreError;
use crate::token::Token;

/// A matrix keyed by token rows and topic columns.
///
/// Mutators are `&self`: rows are guarded by per-row spinlocks so worker
/// threads of one process can share a matrix. `add_token` is the exception:
/// the row set is grown single-threaded before workers start.
pub trait PhiMatrix<S> {
    fn model_name(&self) -> &str;

    fn topic_count(&self) -> usize;

    fn token_count(&self) -> usize;

    fn token(&self, token_id: usize) -> &Token;

    fn token_index(&self, token: &Token) -> Option<usize>;

    /// Reserves an index for `token`; when `publish` is set the row is also
    /// materialized with `init_values`. Adding a known token returns its
    /// existing index and writes nothing.
    fn add_token(
        &mut self,
        store: &mut S,
        token: Token,
        publish: bool,
        init_values: &[f32],
    ) -> Result<usize, StoreError>;

    /// Copies the row into `buffer` (length = topic count).
    fn get(&self, store: &mut S, token_id: usize, buffer: &mut [f32]) -> Result<(), StoreError>;

    /// Overwrites the row.
    fn set(&self, store: &mut S, token_id: usize, values: &[f32]) -> Result<(), StoreError>;

    /// Atomically swaps the row for `values`, returning the previous content
    /// in `buffer`.
    fn get_and_set(
        &self,
        store: &mut S,
        token_id: usize,
        buffer: &mut [f32],
        values: &[f32],
    ) -> Result<(), StoreError>;

    /// Adds `increment` elementwise to the row. Linearizable per row across
    /// processes; a dropped increment (retry exhaustion) is logged by the
    /// implementation and is not an error.
    fn increase(&self, store: &mut S, token_id: usize, increment: &[f32]) -> Result<(), StoreError>;
}
