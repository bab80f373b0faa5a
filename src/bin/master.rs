use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

use dplsa::config::{parse_switch, ConfigError};
use dplsa::master::{run_master, MasterConfig, MasterError};
use dplsa::protocol::CancelToken;
use dplsa::store::RedisStore;

const NUM_RETRIES: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Master process: drives the executor fleet through initialization, the
/// EM iterations, and termination, and reports perplexity per pass.
#[derive(Parser, Debug)]
#[command(name = "dplsa-master")]
struct Args {
    /// Number of topics
    #[arg(long, default_value_t = 1)]
    num_topics: usize,

    /// Number of collection passes
    #[arg(long = "num-outer-iter", default_value_t = 1)]
    num_outer_iter: usize,

    /// Number of executor processes
    #[arg(long, default_value_t = 1)]
    num_executors: usize,

    /// Worker threads per executor
    #[arg(long, default_value_t = 1)]
    num_executor_threads: usize,

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

    /// 1 - print top tokens after fitting, 0 - not
    #[arg(long, default_value_t = 0)]
    show_top_tokens: u8,

    /// 1 - continue fitting the stored model, 0 - restart
    #[arg(long, default_value_t = 0)]
    continue_fitting: u8,

    /// Spawn handshake timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    startup_timeout_ms: u64,
}

fn log_parameters(args: &Args) {
    info!(
        "master parameters: num-topics: {}; num-outer-iter: {}; num-executors: {}; \
         num-executor-threads: {}; batches-dir-path: {}; vocab-path: {}; redis-ip: {}; \
         redis-port: {}; show-top-tokens: {}; continue-fitting: {}; startup-timeout-ms: {}",
        args.num_topics,
        args.num_outer_iter,
        args.num_executors,
        args.num_executor_threads,
        args.batches_dir_path.display(),
        args.vocab_path.display(),
        args.redis_ip,
        args.redis_port,
        args.show_top_tokens,
        args.continue_fitting,
        args.startup_timeout_ms,
    );
}

fn run(args: Args, cancel: &CancelToken) -> Result<(), MasterError> {
    log_parameters(&args);

    if args.redis_ip.is_empty() {
        return Err(ConfigError::Empty("redis_ip").into());
    }

    let config = MasterConfig {
        num_topics: args.num_topics,
        num_outer_iters: args.num_outer_iter,
        num_executors: args.num_executors,
        num_executor_threads: args.num_executor_threads,
        batches_dir_path: args.batches_dir_path,
        vocab_path: args.vocab_path,
        show_top_tokens: parse_switch("show_top_tokens", args.show_top_tokens)?,
        continue_fitting: parse_switch("continue_fitting", args.continue_fitting)?,
        startup_timeout: Duration::from_millis(args.startup_timeout_ms),
    };
    config.validate()?;

    let mut store =
        RedisStore::connect(&args.redis_ip, args.redis_port, NUM_RETRIES, CONNECT_TIMEOUT)?;
    run_master(&mut store, &config, cancel)?;
    Ok(())
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
            error!("master failed: {error}");
            ExitCode::FAILURE
        }
    }
}
