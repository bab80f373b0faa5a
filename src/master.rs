//! The master role: owns the protocol round-trip, merges per-shard
//! reductions, and reports global progress.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{info, warn};
use thiserror::Error;

use crate::config::{require_path, require_positive, ConfigError};
use crate::matrix::{CacheMode, KvPhiMatrix, PhiMatrix};
use crate::memory::process_rss_kb;
use crate::normalize::merge_normalizers;
use crate::protocol::{
    check_finished_or_terminated, check_non_terminated_and_update_all, command_key, data_key,
    CancelToken, Flag, PhaseError,
};
use crate::store::{KvStore, Normalizers, StoreError};
use crate::token::read_vocabulary;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub num_topics: usize,
    pub num_outer_iters: usize,
    pub num_executors: usize,
    pub num_executor_threads: usize,
    pub batches_dir_path: PathBuf,
    pub vocab_path: PathBuf,
    pub show_top_tokens: bool,
    pub continue_fitting: bool,
    /// How long the spawn handshake may take before a silent executor is
    /// declared dead. Every later round waits for shard work and therefore
    /// has no timeout.
    pub startup_timeout: Duration,
}

impl MasterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("num_topics", self.num_topics)?;
        require_positive("num_outer_iters", self.num_outer_iters)?;
        require_positive("num_executors", self.num_executors)?;
        require_positive("num_executor_threads", self.num_executor_threads)?;
        require_path("batches_dir_path", &self.batches_dir_path)?;
        require_path("vocab_path", &self.vocab_path)?;
        Ok(())
    }

    fn worker_keys(&self) -> (Vec<String>, Vec<String>) {
        let mut command_keys = Vec::new();
        let mut data_keys = Vec::new();
        for executor in 0..self.num_executors {
            let executor_id = executor.to_string();
            for thread in 0..self.num_executor_threads {
                command_keys.push(command_key(&executor_id, thread));
                data_keys.push(data_key(&executor_id, thread));
            }
        }
        (command_keys, data_keys)
    }
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("data slot {key} holds {value:?}, expected a number")]
    Data { key: String, value: Option<String> },
}

/// Drives one full fit and returns the perplexity per outer iteration.
///
/// Any failed round pushes `StartTermination` to every command slot before
/// the error is surfaced, so the fleet never outlives its master silently.
pub fn run_master<S: KvStore>(
    store: &mut S,
    config: &MasterConfig,
    cancel: &CancelToken,
) -> Result<Vec<f64>, MasterError> {
    let started = Instant::now();
    config.validate()?;

    let (command_keys, data_keys) = config.worker_keys();
    let result = drive(store, config, &command_keys, &data_keys, cancel);

    // orderly or not, every worker gets told to stop
    for key in &command_keys {
        if let Err(error) = store.set_value(key, Flag::StartTermination.as_ref()) {
            warn!("Master: unable to push termination to {key}: {error}");
        }
    }

    if result.is_ok() {
        if let Err(error) = check_finished_or_terminated(
            store,
            &command_keys,
            Flag::StartTermination,
            Flag::FinishTermination,
            None,
            cancel,
        ) {
            warn!("Master: termination round ended irregularly: {error}");
        }

        if config.show_top_tokens {
            print_top_tokens(store, config, 10)?;
        }
    }

    info!(
        "Master: model fitting is finished, elapsed time: {:.2} sec",
        started.elapsed().as_secs_f64()
    );
    if let Some(rss) = process_rss_kb() {
        info!("Master: final rss={rss} KB");
    }
    result
}

fn drive<S: KvStore>(
    store: &mut S,
    config: &MasterConfig,
    command_keys: &[String],
    data_keys: &[String],
    cancel: &CancelToken,
) -> Result<Vec<f64>, MasterError> {
    info!("Master: start connecting to workers");
    check_finished_or_terminated(
        store,
        command_keys,
        Flag::StartGlobalStart,
        Flag::FinishGlobalStart,
        Some(config.startup_timeout),
        cancel,
    )?;
    info!("Master: all workers are up, start initialization");

    check_non_terminated_and_update_all(store, command_keys, Flag::StartInitialization, cancel)?;
    check_finished_or_terminated(
        store,
        command_keys,
        Flag::StartInitialization,
        Flag::FinishInitialization,
        None,
        cancel,
    )?;

    let total_slots = sum_data_slots(store, data_keys)?;
    info!("Master: finish initialization, total number of token slots: {total_slots}");
    println!("Master: all executors have started! Total number of token slots: {total_slots}");

    if !config.continue_fitting {
        normalize_nwt(store, command_keys, data_keys, config.num_topics, cancel)?;
    }

    let mut history = Vec::with_capacity(config.num_outer_iters);
    for iteration in 0..config.num_outer_iters {
        info!("Master: start iteration {iteration}");

        check_non_terminated_and_update_all(store, command_keys, Flag::StartIteration, cancel)?;
        check_finished_or_terminated(
            store,
            command_keys,
            Flag::StartIteration,
            Flag::FinishIteration,
            None,
            cancel,
        )?;

        let raw_perplexity = sum_data_slots(store, data_keys)?;

        normalize_nwt(store, command_keys, data_keys, config.num_topics, cancel)?;

        let perplexity = (-(1.0 / total_slots) * raw_perplexity).exp();
        info!("Master: iteration {iteration}, perplexity: {perplexity}");
        println!("Iteration: {iteration}, perplexity: {perplexity}");
        if let Some(rss) = process_rss_kb() {
            info!("Master: iteration {iteration}, rss={rss} KB");
        }
        history.push(perplexity);
    }

    Ok(history)
}

fn sum_data_slots<S: KvStore>(store: &mut S, data_keys: &[String]) -> Result<f64, MasterError> {
    let mut sum = 0.0;
    for key in data_keys {
        let value = store.get_value(key)?;
        let parsed = value.as_deref().and_then(|text| text.parse::<f64>().ok());
        match parsed {
            Some(number) => sum += number,
            None => return Err(MasterError::Data {
                key: key.clone(),
                value,
            }),
        }
    }
    Ok(sum)
}

/// Master half of the two-phase distributed normalization: reduce, merge,
/// broadcast, scale.
fn normalize_nwt<S: KvStore>(
    store: &mut S,
    command_keys: &[String],
    data_keys: &[String],
    num_topics: usize,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    check_non_terminated_and_update_all(store, command_keys, Flag::StartNormalization, cancel)?;
    check_finished_or_terminated(
        store,
        command_keys,
        Flag::StartNormalization,
        Flag::FinishNormalization,
        None,
        cancel,
    )?;

    let mut total = Normalizers::new();
    for key in data_keys {
        merge_normalizers(&mut total, store.get_hashmap(key, num_topics)?);
    }
    for key in data_keys {
        store.set_hashmap(key, &total)?;
    }

    check_non_terminated_and_update_all(store, command_keys, Flag::StartNormalization, cancel)?;
    check_finished_or_terminated(
        store,
        command_keys,
        Flag::StartNormalization,
        Flag::FinishNormalization,
        None,
        cancel,
    )
}

/// Reads Φ back from the store and prints the strongest tokens per topic.
fn print_top_tokens<S: KvStore>(
    store: &mut S,
    config: &MasterConfig,
    num_tokens: usize,
) -> Result<(), MasterError> {
    let tokens = read_vocabulary(&config.vocab_path)?;
    let mut p_wt = KvPhiMatrix::new("pwt", config.num_topics, CacheMode::None);
    for token in tokens {
        p_wt.add_token(store, token, false, &[])?;
    }

    let mut rows = Vec::with_capacity(p_wt.token_count());
    let mut buffer = vec![0.0f32; config.num_topics];
    for token_id in 0..p_wt.token_count() {
        p_wt.get(store, token_id, &mut buffer)?;
        rows.push(buffer.clone());
    }

    for topic in 0..config.num_topics {
        println!("\nTopic: topic_{topic}");
        let ranked = (0..p_wt.token_count())
            .map(|token_id| (token_id, rows[token_id][topic]))
            .sorted_by(|a, b| b.1.total_cmp(&a.1))
            .take(num_tokens);
        for (token_id, probability) in ranked {
            println!("{} ({probability})", p_wt.token(token_id));
        }
    }
    Ok(())
}
