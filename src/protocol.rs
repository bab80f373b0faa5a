//! The flag protocol that drives every worker through identical phases.
//!
//! Each worker thread owns one command slot in the store; the master writes
//! `Start*` flags into it and the worker answers with the matching
//! `Finish*`. All waits are 2 ms polls. A slot holding
//! [`Flag::StartTermination`] aborts whatever round is in flight, and
//! [`Flag::FinishTermination`] is a worker's last word.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::store::{KvStore, StoreError};

/// Wire values are single digits so the slots stay human-readable under
/// `redis-cli`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
pub enum Flag {
    #[strum(serialize = "0")]
    StartGlobalStart,
    #[strum(serialize = "1")]
    FinishGlobalStart,
    #[strum(serialize = "2")]
    StartInitialization,
    #[strum(serialize = "3")]
    FinishInitialization,
    #[strum(serialize = "4")]
    StartIteration,
    #[strum(serialize = "5")]
    FinishIteration,
    #[strum(serialize = "6")]
    StartNormalization,
    #[strum(serialize = "7")]
    FinishNormalization,
    #[strum(serialize = "8")]
    StartTermination,
    #[strum(serialize = "9")]
    FinishTermination,
}

pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Command slot of one worker thread.
pub fn command_key(executor_id: &str, thread_index: usize) -> String {
    format!("|cmd-{executor_id}-{thread_index}")
}

/// Data slot of one worker thread.
pub fn data_key(executor_id: &str, thread_index: usize) -> String {
    format!("|dat-{executor_id}-{thread_index}")
}

/// Cooperative cancellation shared between the signal handler and every
/// polling loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a protocol round did not complete.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("a peer reported or requested termination")]
    Terminated,
    #[error("interrupted by signal")]
    Cancelled,
    #[error("workers did not respond within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn slot_holds(reply: &Option<String>, flag: Flag) -> bool {
    reply.as_deref() == Some(flag.as_ref())
}

/// Worker side: blocks until the own command slot shows `flag`.
/// [`Flag::StartTermination`] in the slot or a tripped `cancel` ends the
/// wait with an error instead.
pub fn wait_for_flag<S: KvStore>(
    store: &mut S,
    key: &str,
    flag: Flag,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    loop {
        if cancel.is_cancelled() {
            error!("signal caught while waiting on {key}, start terminating");
            return Err(PhaseError::Cancelled);
        }

        let reply = store.get_value(key)?;
        if slot_holds(&reply, Flag::StartTermination) {
            return Err(PhaseError::Terminated);
        }
        if slot_holds(&reply, flag) {
            return Ok(());
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Worker side: writes `flag` into the own command slot unless the slot
/// already shows [`Flag::StartTermination`] (`force` skips that check; the
/// very first `FinishGlobalStart` uses it because the slot may not exist
/// yet).
pub fn check_non_terminated_and_update<S: KvStore>(
    store: &mut S,
    key: &str,
    flag: Flag,
    force: bool,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    if cancel.is_cancelled() {
        error!("signal caught while updating {key}, start terminating");
        return Err(PhaseError::Cancelled);
    }

    if !force {
        let reply = store.get_value(key)?;
        if slot_holds(&reply, Flag::StartTermination) {
            return Err(PhaseError::Terminated);
        }
    }

    store.set_value(key, flag.as_ref())?;
    Ok(())
}

/// Master side: polls all `keys` until each shows `new`. A slot still at
/// `old` keeps the round open; [`Flag::FinishTermination`] anywhere fails
/// the round, as does exceeding `timeout` (only the startup handshake sets
/// one).
pub fn check_finished_or_terminated<S: KvStore>(
    store: &mut S,
    keys: &[String],
    old: Flag,
    new: Flag,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            error!("signal caught while awaiting workers, start terminating");
            return Err(PhaseError::Cancelled);
        }

        let mut finished = 0;
        let mut terminated = false;
        for key in keys {
            let reply = store.get_value(key)?;
            if slot_holds(&reply, old) {
                break;
            }
            if slot_holds(&reply, new) {
                finished += 1;
                continue;
            }
            if slot_holds(&reply, Flag::FinishTermination) {
                terminated = true;
                break;
            }
        }

        if finished == keys.len() {
            return Ok(());
        }
        if terminated {
            return Err(PhaseError::Terminated);
        }
        if let Some(timeout) = timeout {
            if started.elapsed() > timeout {
                return Err(PhaseError::Timeout(timeout));
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Master side: pushes `flag` to every slot, unless some worker already
/// gave up ([`Flag::FinishTermination`]).
pub fn check_non_terminated_and_update_all<S: KvStore>(
    store: &mut S,
    keys: &[String],
    flag: Flag,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    if cancel.is_cancelled() {
        error!("signal caught before broadcasting {flag}, start terminating");
        return Err(PhaseError::Cancelled);
    }

    for key in keys {
        let reply = store.get_value(key)?;
        if slot_holds(&reply, Flag::FinishTermination) {
            return Err(PhaseError::Terminated);
        }
    }

    for key in keys {
        store.set_value(key, flag.as_ref())?;
    }
    Ok(())
}
