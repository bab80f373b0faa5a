use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

use dplsa::config::{parse_switch, ConfigError};
use dplsa::executor::{run_executor, ExecutorConfig, ExecutorError};
use dplsa::protocol::CancelToken;
use dplsa::store::RedisStore;

const NUM_RETRIES: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Executor process: fits its token and batch shard in lockstep with the
/// rest of the fleet, coordinated through the shared Redis instance.
#[derive(Parser, Debug)]
#[command(name = "dplsa-executor")]
struct Args {
    /// Number of topics
    #[arg(long, default_value_t = 1)]
    num_topics: usize,

    /// Number of document passes
    #[arg(long = "num-inner-iter", default_value_t = 1)]
    num_inner_iter: usize,

    /// Worker threads of this executor
    #[arg(long, default_value_t = 1)]
    num_threads: usize,

    /// Path to batches with documents
    #[arg(long)]
    batches_dir_path: PathBuf,

    /// Path to file with vocabulary
    #[arg(long)]
    vocab_path: PathBuf,

    /// IP of the redis instance
    #[arg(long)]
    redis_ip: String,

    /// Port of the redis instance
    #[arg(long)]
    redis_port: u16,

    /// 1 - continue fitting the stored model, 0 - restart
    #[arg(long, default_value_t = 0)]
    continue_fitting: u8,

    /// 1 - cache phi rows per batch, 0 - always go to the store
    #[arg(long, default_value_t = 0)]
    cache_phi: u8,

    /// Index of first owned token
    #[arg(long, default_value_t = 0)]
    token_begin_index: usize,

    /// Index one past the last owned token
    #[arg(long, default_value_t = 0)]
    token_end_index: usize,

    /// Index of first owned batch
    #[arg(long, default_value_t = 0)]
    batch_begin_index: usize,

    /// Index one past the last owned batch
    #[arg(long, default_value_t = 0)]
    batch_end_index: usize,

    /// Unique identifier of this process
    #[arg(long)]
    executor_id: String,
}

fn log_parameters(args: &Args) {
    info!(
        "executor parameters: num-topics: {}; num-inner-iter: {}; num-threads: {}; \
         batches-dir-path: {}; vocab-path: {}; redis-ip: {}; redis-port: {}; \
         continue-fitting: {}; cache-phi: {}; token-begin-index: {}; token-end-index: {}; \
         batch-begin-index: {}; batch-end-index: {}; executor-id: {}",
        args.num_topics,
        args.num_inner_iter,
        args.num_threads,
        args.batches_dir_path.display(),
        args.vocab_path.display(),
        args.redis_ip,
        args.redis_port,
        args.continue_fitting,
        args.cache_phi,
        args.token_begin_index,
        args.token_end_index,
        args.batch_begin_index,
        args.batch_end_index,
        args.executor_id,
    );
}

fn run(args: Args, cancel: &CancelToken) -> Result<(), ExecutorError> {
    log_parameters(&args);

    if args.redis_ip.is_empty() {
        return Err(ConfigError::Empty("redis_ip").into());
    }

    let config = ExecutorConfig {
        executor_id: args.executor_id,
        num_topics: args.num_topics,
        num_inner_iters: args.num_inner_iter,
        num_threads: args.num_threads,
        batches_dir_path: args.batches_dir_path,
        vocab_path: args.vocab_path,
        continue_fitting: parse_switch("continue_fitting", args.continue_fitting)?,
        cache_phi: parse_switch("cache_phi", args.cache_phi)?,
        cache_nwt_writes: false,
        token_range: args.token_begin_index..args.token_end_index,
        batch_range: args.batch_begin_index..args.batch_end_index,
    };
    config.validate()?;

    let host = args.redis_ip;
    let port = args.redis_port;
    run_executor(
        &config,
        move || RedisStore::connect(&host, port, NUM_RETRIES, CONNECT_TIMEOUT),
        cancel,
    )
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(error) = ctrlc::set_handler(move || cancel.cancel()) {
            warn!("unable to install the signal handler: {error}");
        }
    }

    match run(args, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("executor failed: {error}");
            ExitCode::FAILURE
        }
    }
}
