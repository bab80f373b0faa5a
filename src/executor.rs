//! The executor role: one process owning a token shard and a batch shard,
//! running `num_threads` worker threads in lockstep with the rest of the
//! fleet.

use std::ops::Range;
use std::path::PathBuf;
use std::time::Instant;

use log::{error, info};
use thiserror::Error;

use crate::batch::{list_batches, load_batch, BatchError};
use crate::config::{require_path, require_positive, require_range, ConfigError};
use crate::estep::{process_batch, Numerics};
use crate::matrix::{CacheMode, KvPhiMatrix, PhiMatrix};
use crate::memory::process_rss_kb;
use crate::normalize::{find_nt, scale_rows};
use crate::protocol::{
    check_non_terminated_and_update, command_key, data_key, wait_for_flag, CancelToken, Flag,
    PhaseError,
};
use crate::seeding::initial_nwt_row;
use crate::sharding::subshard_range;
use crate::store::{KvStore, StoreError};
use crate::token::read_vocabulary;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub num_topics: usize,
    pub num_inner_iters: usize,
    pub num_threads: usize,
    pub batches_dir_path: PathBuf,
    pub vocab_path: PathBuf,
    pub continue_fitting: bool,
    /// Serve repeated Φ row reads from a per-batch cache.
    pub cache_phi: bool,
    /// Buffer accumulator increments locally and flush them at batch
    /// boundaries instead of one optimistic transaction per row.
    pub cache_nwt_writes: bool,
    /// Token shard of this executor, subdivided across its threads.
    pub token_range: Range<usize>,
    /// Batch shard of this executor, subdivided across its threads.
    pub batch_range: Range<usize>,
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor_id.is_empty() {
            return Err(ConfigError::Empty("executor_id"));
        }
        require_positive("num_topics", self.num_topics)?;
        require_positive("num_inner_iters", self.num_inner_iters)?;
        require_positive("num_threads", self.num_threads)?;
        require_path("batches_dir_path", &self.batches_dir_path)?;
        require_path("vocab_path", &self.vocab_path)?;
        require_range("token_index", &self.token_range)?;
        require_range("batch_index", &self.batch_range)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error("worker thread panicked")]
    WorkerPanic,
}

struct Worker<'a> {
    command_key: String,
    data_key: String,
    continue_fitting: bool,
    num_inner_iters: usize,
    token_range: Range<usize>,
    batch_range: Range<usize>,
    batch_paths: &'a [PathBuf],
    p_wt: &'a KvPhiMatrix,
    n_wt: &'a KvPhiMatrix,
    cancel: &'a CancelToken,
}

impl<'a> Worker<'a> {
    /// Full worker lifetime. Whatever happens inside, the command slot ends
    /// up holding `FinishTermination` so the master never waits on a corpse.
    fn run<S: KvStore>(&self, store: &mut S) -> Result<(), ExecutorError> {
        let result = self.phases(store);
        match &result {
            Ok(()) => info!("worker {}: has finished", self.command_key),
            Err(error) => error!("worker {}: terminating on error: {error}", self.command_key),
        }
        if let Err(error) = store.set_value(&self.command_key, Flag::FinishTermination.as_ref()) {
            error!(
                "worker {}: unable to report termination: {error}",
                self.command_key
            );
        }
        result
    }

    fn phases<S: KvStore>(&self, store: &mut S) -> Result<(), ExecutorError> {
        let key = &self.command_key;

        check_non_terminated_and_update(store, key, Flag::FinishGlobalStart, true, self.cancel)?;
        wait_for_flag(store, key, Flag::StartInitialization, self.cancel)?;

        info!(
            "worker {key}: start initialization, tokens {:?}, batches {:?}",
            self.token_range, self.batch_range
        );

        if !self.continue_fitting {
            self.publish_initial_rows(store)?;
        }

        let slots = self.count_token_slots()?;
        store.set_value(&self.data_key, &slots.to_string())?;
        info!("worker {key}: finish initialization, {slots} token slots in shard");

        check_non_terminated_and_update(store, key, Flag::FinishInitialization, false, self.cancel)?;

        if !self.continue_fitting {
            self.normalize_nwt(store)?;
        }

        loop {
            match wait_for_flag(store, key, Flag::StartIteration, self.cancel) {
                Ok(()) => {}
                // the one place termination is the expected way out
                Err(PhaseError::Terminated) | Err(PhaseError::Cancelled) => break,
                Err(error) => return Err(error.into()),
            }

            let perplexity = self.process_shard(store)?;
            store.set_value(&self.data_key, &perplexity.to_string())?;
            info!("worker {key}: local pre-perplexity value: {perplexity}");

            check_non_terminated_and_update(store, key, Flag::FinishIteration, false, self.cancel)?;

            self.normalize_nwt(store)?;

            if let Some(rss) = process_rss_kb() {
                info!("worker {key}: finish iteration, rss={rss} KB");
            }
        }
        Ok(())
    }

    /// Seeds the rows of this worker's token subshard: Φ rows zeroed, N rows
    /// set to their deterministic random vectors.
    fn publish_initial_rows<S: KvStore>(&self, store: &mut S) -> Result<(), StoreError> {
        let num_topics = self.p_wt.topic_count();
        let zeros = vec![0.0f32; num_topics];
        for token_id in self.token_range.clone() {
            self.p_wt.set(store, token_id, &zeros)?;
            let row = initial_nwt_row(num_topics, self.n_wt.token(token_id), None);
            self.n_wt.set(store, token_id, &row)?;
        }
        Ok(())
    }

    fn count_token_slots(&self) -> Result<f64, BatchError> {
        let mut slots = 0.0;
        for path in &self.batch_paths[self.batch_range.clone()] {
            slots += load_batch(path)?.token_slot_count();
        }
        Ok(slots)
    }

    /// One E-step pass over the worker's batches. Caches are released at
    /// batch boundaries: Φ rows read for one batch are useless for the next,
    /// and buffered N increments must land before the iteration barrier.
    fn process_shard<S: KvStore>(&self, store: &mut S) -> Result<f64, ExecutorError> {
        let mut perplexity = 0.0f64;
        for path in &self.batch_paths[self.batch_range.clone()] {
            let batch = load_batch(path)?;
            perplexity += process_batch(
                &batch,
                self.p_wt,
                self.n_wt,
                store,
                &Numerics,
                self.num_inner_iters,
            )?;

            if self.p_wt.cache_mode() == CacheMode::Read {
                self.p_wt.clear_read_cache();
            }
            if self.n_wt.cache_mode() == CacheMode::Write {
                self.n_wt.flush(store)?;
            }
        }
        Ok(perplexity)
    }

    /// Worker half of the two-phase distributed normalization:
    /// reduce the own shard, hand the partial normalizer to the master, wait
    /// for the merged one, then rewrite the shard's Φ rows while swapping
    /// the accumulator rows back to zero.
    fn normalize_nwt<S: KvStore>(&self, store: &mut S) -> Result<(), PhaseError> {
        let key = &self.command_key;
        wait_for_flag(store, key, Flag::StartNormalization, self.cancel)?;

        let partial = find_nt(self.n_wt, store, self.token_range.clone())?;
        store.set_hashmap(&self.data_key, &partial)?;
        check_non_terminated_and_update(store, key, Flag::FinishNormalization, false, self.cancel)?;

        wait_for_flag(store, key, Flag::StartNormalization, self.cancel)?;

        let merged = store.get_hashmap(&self.data_key, self.n_wt.topic_count())?;
        scale_rows(
            self.p_wt,
            self.n_wt,
            store,
            self.token_range.clone(),
            &merged,
            true,
        )?;
        check_non_terminated_and_update(store, key, Flag::FinishNormalization, false, self.cancel)
    }
}

/// Runs one executor process: builds the shared matrices from the
/// vocabulary, spawns `num_threads` workers (each with its own store
/// connection from `connect`), and joins them.
pub fn run_executor<S, F>(
    config: &ExecutorConfig,
    connect: F,
    cancel: &CancelToken,
) -> Result<(), ExecutorError>
where
    S: KvStore,
    F: Fn() -> Result<S, StoreError> + Sync,
{
    let started = Instant::now();
    config.validate()?;

    // fail fast on connectivity before any protocol side effect
    let mut setup_store = connect()?;

    let tokens = read_vocabulary(&config.vocab_path)?;
    info!(
        "executor {}: {} tokens in vocabulary",
        config.executor_id,
        tokens.len()
    );

    let phi_cache = if config.cache_phi {
        CacheMode::Read
    } else {
        CacheMode::None
    };
    let nwt_cache = if config.cache_nwt_writes {
        CacheMode::Write
    } else {
        CacheMode::None
    };

    let mut p_wt = KvPhiMatrix::new("pwt", config.num_topics, phi_cache);
    let mut n_wt = KvPhiMatrix::new("nwt", config.num_topics, nwt_cache);
    for token in tokens {
        p_wt.add_token(&mut setup_store, token.clone(), false, &[])?;
        n_wt.add_token(&mut setup_store, token, false, &[])?;
    }
    drop(setup_store);

    let batch_paths = list_batches(&config.batches_dir_path)?;
    if config.token_range.end > p_wt.token_count() {
        return Err(ConfigError::BadRange {
            name: "token_index",
            begin: config.token_range.start,
            end: config.token_range.end,
        }
        .into());
    }
    if config.batch_range.end > batch_paths.len() {
        return Err(ConfigError::BadRange {
            name: "batch_index",
            begin: config.batch_range.start,
            end: config.batch_range.end,
        }
        .into());
    }

    let results: Vec<Result<(), ExecutorError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.num_threads)
            .map(|thread_index| {
                let worker = Worker {
                    command_key: command_key(&config.executor_id, thread_index),
                    data_key: data_key(&config.executor_id, thread_index),
                    continue_fitting: config.continue_fitting,
                    num_inner_iters: config.num_inner_iters,
                    token_range: subshard_range(
                        &config.token_range,
                        thread_index,
                        config.num_threads,
                    ),
                    batch_range: subshard_range(
                        &config.batch_range,
                        thread_index,
                        config.num_threads,
                    ),
                    batch_paths: &batch_paths,
                    p_wt: &p_wt,
                    n_wt: &n_wt,
                    cancel,
                };
                let connect = &connect;
                scope.spawn(move || {
                    let mut store = connect()?;
                    worker.run(&mut store)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(Err(ExecutorError::WorkerPanic)))
            .collect()
    });

    if let Some(rss) = process_rss_kb() {
        info!("executor {}: final rss={rss} KB", config.executor_id);
    }
    info!(
        "executor {}: finished, elapsed time: {:.2} sec",
        config.executor_id,
        started.elapsed().as_secs_f64()
    );

    for result in results {
        result?;
    }
    Ok(())
}
