//! # mine-ib
//!
//! Mutual information neural estimation (MINE) and the alternating training loop that uses it
//! as an information-bottleneck regularizer.
//!
//! This crate is intentionally small:
//!
//! - it implements the **MINE estimator** (`mine-d`: Donsker-Varadhan with EMA bias
//!   correction, `mine-f`: NWJ / f-divergence bound),
//! - it implements **adaptive gradient clipping** between two losses sharing parameters,
//! - it implements an **alternating classifier / estimator training loop** with resumable
//!   checkpoints,
//! - it does not provide a CLI or dataset downloaders.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every source of randomness (marginal shuffles,
//!   initialization, loader order, noise) is a `ChaCha8Rng` seeded from a config or argument.
//! - **Exactly one optimizer steps per minibatch**: the [`schedule::PhaseSelector`] decides which.
//! - **Gradient buffers are cleared explicitly** before each accumulation phase.
//! - **Backend-agnostic by default**: the core uses `ndarray` with hand-written backward passes;
//!   no framework types leak through the public API in the default feature set.
//!   - An autodiff backend (`burn`) is **feature-gated**.
//!
//! ## How this maps to MINE (papers)
//!
//! With `T_j = T(x_i, z_i)` on joint samples and `T_m = T(x_i, z_{π(i)})` on a shuffled batch:
//!
//! - `mine-d` reports `mean(T_j) - log(mean(exp(T_m)))` and minimizes
//!   `-(mean(T_j) - mean(exp(T_m)) / ema)`, where `ema` is a moving average of
//!   `mean(exp(T_m))` held constant for differentiation.
//! - `mine-f` reports `mean(T_j) - mean(exp(T_m - 1))` and minimizes its negation.
//!
//! ## References
//!
//! - Belghazi et al., *Mutual Information Neural Estimation* (ICML 2018, arXiv:1801.04062).
//! - Nguyen, Wainwright & Jordan, *Estimating divergence functionals and the likelihood ratio
//!   by convex risk minimization* (IEEE Trans. IT, 2010).
//! - Ganin & Lempitsky, *Unsupervised Domain Adaptation by Backpropagation* (ICML 2015):
//!   gradient reversal.
//!
//! ## Module map
//!
//! - `mine`: the estimator (batch loss, EMA state, whole-dataset estimate)
//! - `stats`: statistics functions `T(x, z)`
//! - `model`: bottleneck classifiers `x -> (logits, z)`
//! - `clip`: adaptive gradient clipping
//! - `grl`: gradient reversal
//! - `schedule`: classifier / estimator phase selection
//! - `optim`: SGD / RMSProp / Adam with parameter groups
//! - `train`: the alternating loop, validation and checkpoint restore
//! - `checkpoint`, `config`, `data`, `metrics`: the supporting pieces
//! - `burn_mine` (feature `burn`): the same estimator on burn's autodiff

pub mod checkpoint;
pub mod clip;
pub mod config;
pub mod data;
pub mod grl;
pub mod loss;
pub mod metrics;
pub mod mine;
pub mod model;
pub mod nn;
pub mod optim;
pub mod param;
pub mod schedule;
pub mod stats;
pub mod train;

#[cfg(feature = "burn")]
pub mod burn_mine;

pub use mine::{Criterion, Mine, MineState};
pub use schedule::{Phase, PhaseSelector, Schedule};
pub use train::Trainer;

/// mine-ib error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    /// Marginal sampling by shuffling needs at least two rows.
    #[error("batch of {batch} rows is too small for MINE (need >= 2)")]
    InsufficientBatch { batch: usize },
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
