//! Resumable training state.
//!
//! The record holds everything needed to continue the alternating optimization:
//! epoch, best validation error, bottleneck width, both optimizers, both parameter sets,
//! the alternation step counter and (optionally) the MINE EMA/RNG state. Serialized as JSON.

use crate::mine::MineState;
use crate::optim::OptimizerState;
use crate::{Error, Result};
use ndarray::Array2;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    /// Percent; `None` until the first validation.
    pub best_validation_error: Option<f32>,
    pub bottleneck_dim: usize,
    /// Minibatches processed over the whole run.
    pub global_step: u64,
    pub classifier_optimizer: OptimizerState,
    pub estimator_optimizer: OptimizerState,
    pub classifier_params: Vec<Array2<f32>>,
    pub statistics_params: Vec<Array2<f32>>,
    /// Absent when the run was configured not to persist it.
    #[serde(default)]
    pub mine: Option<MineState>,
    /// Train-mode noise RNG of the statistics function, when it has one.
    #[serde(default)]
    pub statistics_noise: Option<ChaCha8Rng>,
}

impl Checkpoint {
    /// Write atomically: serialize to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `Ok(None)` when no checkpoint exists yet.
    pub fn load_if_exists(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// The model topology must match saved parameters, so a stored bottleneck width wins
/// over the requested one.
pub fn resolve_bottleneck_dim(requested: usize, checkpoint: Option<&Checkpoint>) -> usize {
    match checkpoint {
        Some(ckpt) if ckpt.bottleneck_dim != requested => {
            tracing::warn!(
                requested,
                stored = ckpt.bottleneck_dim,
                "bottleneck_dim overridden by checkpoint"
            );
            ckpt.bottleneck_dim
        }
        Some(ckpt) => ckpt.bottleneck_dim,
        None => requested,
    }
}

/// Fail before training if a built model cannot hold the checkpoint's bottleneck.
pub fn ensure_bottleneck_dim(model_dim: usize, checkpoint: &Checkpoint) -> Result<()> {
    if model_dim != checkpoint.bottleneck_dim {
        return Err(Error::Config(format!(
            "model bottleneck_dim {model_dim} does not match checkpoint bottleneck_dim {}",
            checkpoint.bottleneck_dim
        )));
    }
    Ok(())
}
