//! Proof-of-work pipeline: difficulty schedule, work derivation, candidate
//! assembly, and the out-of-process nonce search.

pub mod builder;
pub mod difficulty;
pub mod work;
pub mod worker;

pub use builder::{prepare_new_block, AssemblyContext};
pub use difficulty::{get_diff, get_exp_factor_diff, minimum_difficulty, MAX_SAFE_DIFFICULTY};
pub use work::{child_chain_root, distance, merkle_root, prepare_work};
pub use worker::{DifficultyData, WorkerHandle, WorkerJob};
