//! End-to-end fits: a real master and real executor workers running as
//! threads against one shared in-memory blackboard.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use approx::assert_relative_eq;

use dplsa::batch::{list_batches, Batch, BatchItem};
use dplsa::executor::{run_executor, ExecutorConfig, ExecutorError};
use dplsa::master::{run_master, MasterConfig, MasterError};
use dplsa::protocol::{command_key, CancelToken, Flag};
use dplsa::sharding::shard_range;
use dplsa::store::{KvStore, MemoryStore};
use dplsa::token::read_vocabulary;

fn write_vocabulary(dir: &Path, words: &[&str]) -> PathBuf {
    let path = dir.join("vocab.txt");
    std::fs::write(&path, words.join("\n")).unwrap();
    path
}

fn batches_dir(dir: &Path) -> PathBuf {
    let path = dir.join("batches");
    std::fs::create_dir(&path).unwrap();
    path
}

fn write_batch(dir: &Path, name: &str, tokens: &[&str], weights: &[(usize, f32)]) {
    let batch = Batch {
        id: None,
        tokens: tokens.iter().map(|t| t.to_string()).collect(),
        class_ids: Vec::new(),
        items: vec![BatchItem {
            token_ids: weights.iter().map(|&(id, _)| id).collect(),
            token_weights: weights.iter().map(|&(_, w)| w).collect(),
        }],
    };
    serde_json::to_writer(File::create(dir.join(name)).unwrap(), &batch).unwrap();
}

struct Fleet {
    num_executors: usize,
    num_threads: usize,
    num_topics: usize,
    num_inner_iters: usize,
    num_outer_iters: usize,
    continue_fitting: bool,
}

fn run_fleet(
    store: &MemoryStore,
    batches_dir: &Path,
    vocab_path: &Path,
    fleet: &Fleet,
) -> (
    Result<Vec<f64>, MasterError>,
    Vec<Result<(), ExecutorError>>,
) {
    let vocab_size = read_vocabulary(vocab_path).unwrap().len();
    let num_batches = list_batches(batches_dir).unwrap().len();
    let cancel = CancelToken::new();

    std::thread::scope(|scope| {
        let master_config = MasterConfig {
            num_topics: fleet.num_topics,
            num_outer_iters: fleet.num_outer_iters,
            num_executors: fleet.num_executors,
            num_executor_threads: fleet.num_threads,
            batches_dir_path: batches_dir.to_path_buf(),
            vocab_path: vocab_path.to_path_buf(),
            show_top_tokens: false,
            continue_fitting: fleet.continue_fitting,
            startup_timeout: Duration::from_secs(5),
        };
        let master = scope.spawn({
            let mut store = store.clone();
            let cancel = cancel.clone();
            move || run_master(&mut store, &master_config, &cancel)
        });

        let executors: Vec<_> = (0..fleet.num_executors)
            .map(|index| {
                let config = ExecutorConfig {
                    executor_id: index.to_string(),
                    num_topics: fleet.num_topics,
                    num_inner_iters: fleet.num_inner_iters,
                    num_threads: fleet.num_threads,
                    batches_dir_path: batches_dir.to_path_buf(),
                    vocab_path: vocab_path.to_path_buf(),
                    continue_fitting: fleet.continue_fitting,
                    cache_phi: false,
                    cache_nwt_writes: false,
                    token_range: shard_range(index, fleet.num_executors, vocab_size),
                    batch_range: shard_range(index, fleet.num_executors, num_batches),
                };
                let store = store.clone();
                let cancel = cancel.clone();
                scope.spawn(move || run_executor(&config, || Ok(store.clone()), &cancel))
            })
            .collect();

        (
            master.join().unwrap(),
            executors.into_iter().map(|h| h.join().unwrap()).collect(),
        )
    })
}

fn phi_rows(store: &MemoryStore, vocab_size: usize, num_topics: usize) -> Vec<Vec<f32>> {
    let mut reader = store.clone();
    (0..vocab_size)
        .map(|id| reader.get_values(&format!("{id}pwt"), num_topics).unwrap())
        .collect()
}

#[test]
fn single_worker_fit_converges_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = write_vocabulary(dir.path(), &["a", "b"]);
    let batches = batches_dir(dir.path());
    write_batch(&batches, "b0.json", &["a", "b"], &[(0, 2.0), (1, 1.0)]);

    let store = MemoryStore::new();
    let fleet = Fleet {
        num_executors: 1,
        num_threads: 1,
        num_topics: 2,
        num_inner_iters: 5,
        num_outer_iters: 1,
        continue_fitting: false,
    };
    let (master, executors) = run_fleet(&store, &batches, &vocab, &fleet);

    let perplexities = master.unwrap();
    assert_eq!(perplexities.len(), 1);
    assert!(perplexities[0].is_finite());
    assert!(perplexities[0] > 0.0);
    for result in executors {
        result.unwrap();
    }

    // the topic columns of phi are probability distributions
    let rows = phi_rows(&store, 2, 2);
    for topic in 0..2 {
        let sum: f32 = rows.iter().map(|row| row[topic]).sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
        assert!(rows.iter().all(|row| row[topic] >= 0.0));
    }

    // every worker signed off
    let mut reader = store.clone();
    assert_eq!(
        reader.get_value(&command_key("0", 0)).unwrap().as_deref(),
        Some(Flag::FinishTermination.as_ref())
    );
}

#[test]
fn sharded_fit_matches_the_single_worker_fit() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = write_vocabulary(dir.path(), &["a", "b", "c", "d"]);
    let batches = batches_dir(dir.path());
    write_batch(&batches, "b0.json", &["a", "b"], &[(0, 2.0), (1, 1.0)]);
    write_batch(&batches, "b1.json", &["c", "d"], &[(0, 1.0), (1, 3.0)]);

    let mut all_rows = Vec::new();
    for num_executors in [1, 2] {
        let store = MemoryStore::new();
        let fleet = Fleet {
            num_executors,
            num_threads: 1,
            num_topics: 2,
            num_inner_iters: 5,
            num_outer_iters: 2,
            continue_fitting: false,
        };
        let (master, executors) = run_fleet(&store, &batches, &vocab, &fleet);
        master.unwrap();
        for result in executors {
            result.unwrap();
        }
        all_rows.push(phi_rows(&store, 4, 2));
    }

    for (row_single, row_sharded) in all_rows[0].iter().zip(&all_rows[1]) {
        for (a, b) in row_single.iter().zip(row_sharded) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}

#[test]
fn continue_fitting_runs_on_top_of_the_stored_model() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = write_vocabulary(dir.path(), &["a", "b"]);
    let batches = batches_dir(dir.path());
    write_batch(&batches, "b0.json", &["a", "b"], &[(0, 2.0), (1, 1.0)]);

    let store = MemoryStore::new();
    let fresh = Fleet {
        num_executors: 1,
        num_threads: 1,
        num_topics: 2,
        num_inner_iters: 5,
        num_outer_iters: 1,
        continue_fitting: false,
    };
    run_fleet(&store, &batches, &vocab, &fresh).0.unwrap();

    let continued = Fleet {
        continue_fitting: true,
        ..fresh
    };
    let (master, executors) = run_fleet(&store, &batches, &vocab, &continued);

    let perplexities = master.unwrap();
    assert!(perplexities[0].is_finite());
    for result in executors {
        result.unwrap();
    }

    let rows = phi_rows(&store, 2, 2);
    for topic in 0..2 {
        let sum: f32 = rows.iter().map(|row| row[topic]).sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
    }
}

#[test]
fn termination_after_initialization_stops_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = write_vocabulary(dir.path(), &["a", "b"]);
    let batches = batches_dir(dir.path());
    write_batch(&batches, "b0.json", &["a", "b"], &[(0, 2.0), (1, 1.0)]);

    let store = MemoryStore::new();
    let cancel = CancelToken::new();

    let result = std::thread::scope(|scope| {
        let executor = scope.spawn({
            let store = store.clone();
            let cancel = cancel.clone();
            let config = ExecutorConfig {
                executor_id: "0".to_string(),
                num_topics: 2,
                num_inner_iters: 5,
                num_threads: 2,
                batches_dir_path: batches.clone(),
                vocab_path: vocab.clone(),
                continue_fitting: false,
                cache_phi: false,
                cache_nwt_writes: false,
                token_range: 0..2,
                batch_range: 0..1,
            };
            move || run_executor(&config, || Ok(store.clone()), &cancel)
        });

        let keys = [command_key("0", 0), command_key("0", 1)];
        let mut driver = store.clone();

        // drive the handshake and initialization by hand
        for key in &keys {
            while driver.get_value(key).unwrap().as_deref() != Some("1") {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        for key in &keys {
            driver.set_value(key, "2").unwrap();
        }
        for key in &keys {
            while driver.get_value(key).unwrap().as_deref() != Some("3") {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // then pull the plug instead of starting the normalization
        for key in &keys {
            driver.set_value(key, Flag::StartTermination.as_ref()).unwrap();
        }

        let result = executor.join().unwrap();

        for key in &keys {
            assert_eq!(
                driver.get_value(key).unwrap().as_deref(),
                Some(Flag::FinishTermination.as_ref())
            );
        }
        result
    });

    assert!(matches!(result, Err(ExecutorError::Phase(_))));
}
