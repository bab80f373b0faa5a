//! Distributed EM fitting of probabilistic topic models.
//!
//! The crate factorizes a document-term collection into a word-topic matrix
//! `pwt` and per-document topic distributions, with the accumulator matrix
//! `nwt` and all coordination state living in a shared key-value store (the
//! blackboard). One master process drives any number of executor processes
//! through a flag-based barrier protocol; every executor owns a contiguous
//! shard of the vocabulary and of the batch files.
//!
//! The two binaries (`dplsa-master`, `dplsa-executor`) are thin CLI shells
//! over [`master::run_master`] and [`executor::run_executor`]. Everything is
//! generic over the [`store::KvStore`] trait, so whole fleets can also be
//! driven in-process against [`store::MemoryStore`].

pub mod batch;
pub mod config;
pub mod estep;
pub mod executor;
pub mod master;
pub mod matrix;
pub mod memory;
pub mod normalize;
pub mod protocol;
pub mod seeding;
pub mod sharding;
pub mod store;
pub mod token;

/// Probability floor shared by the E-step and the normalization passes.
/// Values below it are snapped to zero.
pub const EPS: f32 = 1e-16;
