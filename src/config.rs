//! Training configuration.
//!
//! Defaults describe the standard information-bottleneck run (SGD, `lr_clf = 0.05`,
//! `lr_mine = 1e-5`, batch 128, bottleneck 256, EMA decay 0.999).

use crate::mine::Criterion;
use crate::optim::{build_optimizer, OptimOptions, Optimizer, OptimizerKind, ParamGroup};
use crate::schedule::Schedule;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the MI loss's gradient reaches the classifier through `z`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BottleneckGradient {
    /// `z` is detached: the MI term is monitoring only for the classifier.
    Detached,
    /// `dL_ib/dz` flows into the classifier unchanged.
    Direct,
    /// `dL_ib/dz` is multiplied by `-beta` (gradient reversal).
    Reversed { beta: f32 },
}

/// Serialized form of [`BottleneckGradient`]; the reversal strength comes from
/// [`TrainConfig::beta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckRoute {
    Detached,
    Direct,
    Reversed,
}

impl BottleneckRoute {
    pub fn with_beta(self, beta: f32) -> BottleneckGradient {
        match self {
            Self::Detached => BottleneckGradient::Detached,
            Self::Direct => BottleneckGradient::Direct,
            Self::Reversed => BottleneckGradient::Reversed { beta },
        }
    }
}

/// Named training presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// Interleaved schedule, MI gradient flows into the classifier.
    Mine,
    /// Classifier warmup then estimator-only, `z` always detached.
    Base,
}

impl ModelVariant {
    pub fn default_schedule(self) -> Schedule {
        match self {
            Self::Mine => Schedule::Interleaved { period: 10 },
            Self::Base => Schedule::ClassifierWarmup {
                classifier_epochs: 100,
            },
        }
    }

    pub fn default_bottleneck_route(self) -> BottleneckRoute {
        match self {
            Self::Mine => BottleneckRoute::Direct,
            Self::Base => BottleneckRoute::Detached,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub variant: ModelVariant,
    /// Overrides the variant's schedule.
    pub schedule: Option<Schedule>,
    /// Overrides the variant's bottleneck gradient policy.
    pub bottleneck_gradient: Option<BottleneckRoute>,
    pub criterion: Criterion,
    pub optimizer: String,
    pub lr_clf: f32,
    pub lr_mine: f32,
    pub weight_decay: f32,
    pub momentum: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub bottleneck_dim: usize,
    /// Gradient reversal strength for [`BottleneckRoute::Reversed`].
    pub beta: f32,
    pub ema_decay: f64,
    /// Cap the MI gradient at the supervised gradient's norm on classifier steps.
    pub adaptive_clip: bool,
    /// Store the MINE EMA/RNG in checkpoints.
    pub persist_ema: bool,
    pub drop_last: bool,
    pub seed: u64,
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            variant: ModelVariant::Mine,
            schedule: None,
            bottleneck_gradient: None,
            criterion: Criterion::MineD,
            optimizer: "sgd".to_string(),
            lr_clf: 0.05,
            lr_mine: 1e-5,
            weight_decay: 0.0,
            momentum: 0.9,
            batch_size: 128,
            epochs: 10_000,
            bottleneck_dim: 256,
            beta: 1e-3,
            ema_decay: 0.999,
            adaptive_clip: false,
            persist_ema: true,
            drop_last: true,
            seed: 0,
            checkpoint_path: None,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let kind: OptimizerKind = self.optimizer.parse()?;
        if !(self.ema_decay > 0.0 && self.ema_decay < 1.0) {
            return Err(Error::Config(format!("ema_decay {} not in (0, 1)", self.ema_decay)));
        }
        if self.batch_size < 2 {
            return Err(Error::Config(
                "batch_size must be >= 2 for marginal sampling".into(),
            ));
        }
        if !(self.lr_clf > 0.0) || !(self.lr_mine > 0.0) {
            return Err(Error::Config("learning rates must be positive".into()));
        }
        if self.bottleneck_dim == 0 {
            return Err(Error::Config("bottleneck_dim must be >= 1".into()));
        }
        if kind.uses_momentum() && !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::Config("momentum must be in [0, 1)".into()));
        }
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(Error::Config(format!("beta {} must be finite and >= 0", self.beta)));
        }
        if let Schedule::Interleaved { period: 0 } = self.schedule() {
            return Err(Error::Config("interleaved period must be >= 1".into()));
        }
        Ok(())
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.unwrap_or_else(|| self.variant.default_schedule())
    }

    pub fn bottleneck_gradient(&self) -> BottleneckGradient {
        self.bottleneck_gradient
            .unwrap_or_else(|| self.variant.default_bottleneck_route())
            .with_beta(self.beta)
    }

    fn global_options(&self) -> Result<OptimOptions> {
        let kind: OptimizerKind = self.optimizer.parse()?;
        Ok(OptimOptions {
            lr: self.lr_clf,
            weight_decay: self.weight_decay,
            momentum: if kind.uses_momentum() { self.momentum } else { 0.0 },
        })
    }

    /// Classifier optimizer: global options over all classifier parameters.
    pub fn build_classifier_optimizer(&self) -> Result<Optimizer> {
        build_optimizer(&self.optimizer, vec![ParamGroup::all()], self.global_options()?)
    }

    /// Estimator optimizer: global options with `lr_mine` as the group learning rate.
    pub fn build_estimator_optimizer(&self) -> Result<Optimizer> {
        build_optimizer(
            &self.optimizer,
            vec![ParamGroup::all().with_lr(self.lr_mine)],
            self.global_options()?,
        )
    }
}
