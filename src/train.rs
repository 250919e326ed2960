//! Alternating training of a bottleneck classifier and a MINE statistics function.
//!
//! Per minibatch:
//! 1. classifier forward `x -> (logits, z)`
//! 2. supervised cross-entropy
//! 3. MINE estimate on `(x, z)`
//! 4. the [`PhaseSelector`] picks exactly one optimizer to step:
//!    - [`Phase::Classifier`]: gradients of `xent + loss_ib` into the classifier (the MI part
//!      routed through `z` per [`BottleneckGradient`]); only the classifier optimizer steps.
//!    - [`Phase::Estimator`]: gradients of `loss_ib` into the statistics function; only the
//!      estimator optimizer steps.
//!
//! Gradient buffers of the stepped model are cleared right before they are filled.

use crate::checkpoint::{ensure_bottleneck_dim, Checkpoint};
use crate::clip::{adaptive_clipping, ClipReport};
use crate::config::{BottleneckGradient, TrainConfig};
use crate::data::LabeledLoader;
use crate::grl::GradientReversal;
use crate::loss::cross_entropy;
use crate::metrics::{Accuracy, Mean, Metric};
use crate::mine::Mine;
use crate::model::Classifier;
use crate::optim::Optimizer;
use crate::schedule::{Phase, PhaseSelector, Schedule};
use crate::stats::StatisticsFunction;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use std::path::Path;

/// Running metrics for the current epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    pub train_accuracy: Accuracy,
    pub xent: Mean,
    pub emi: Mean,
    pub valid_accuracy: Accuracy,
}

/// What happened on one minibatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub phase: Phase,
    pub classifier_stepped: bool,
    pub estimator_stepped: bool,
    pub xent: f32,
    pub emi: f32,
    pub loss_ib: f32,
    /// Present when adaptive clipping ran on this step.
    pub clip: Option<ClipReport>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    /// 1-based index of the finished epoch.
    pub epoch: usize,
    pub steps: usize,
    /// Percent.
    pub train_error: f32,
    pub xent: f32,
    pub emi: f32,
    /// Percent.
    pub valid_error: f32,
    pub best_valid_error: f32,
    pub improved: bool,
}

pub struct Trainer<C, S, P = Schedule> {
    classifier: C,
    mine: Mine<S>,
    optim_clf: Optimizer,
    optim_mine: Optimizer,
    selector: P,
    z_gradient: BottleneckGradient,
    adaptive_clip: bool,
    persist_ema: bool,
    epoch: usize,
    global_step: u64,
    best_val_error: Option<f32>,
    metrics: EpochMetrics,
}

fn error_percent(acc: &Accuracy) -> f32 {
    (1.0 - acc.result()) * 100.0
}

/// Route `dL_ib/dz` into the classifier per policy (`None` = detached).
fn route_bottleneck_grad(policy: BottleneckGradient, dz: Array2<f32>) -> Result<Option<Array2<f32>>> {
    Ok(match policy {
        BottleneckGradient::Detached => None,
        BottleneckGradient::Direct => Some(dz),
        BottleneckGradient::Reversed { beta } => {
            Some(GradientReversal::new(beta)?.backward(&dz.view()))
        }
    })
}

impl<C, S> Trainer<C, S, Schedule>
where
    C: Classifier,
    S: StatisticsFunction,
{
    /// Build optimizers, the MINE engine and the schedule from `cfg`.
    pub fn from_config(cfg: &TrainConfig, classifier: C, statistics: S) -> Result<Self> {
        cfg.validate()?;
        if classifier.bottleneck_dim() != cfg.bottleneck_dim {
            return Err(Error::Config(format!(
                "classifier bottleneck_dim {} does not match config {}",
                classifier.bottleneck_dim(),
                cfg.bottleneck_dim
            )));
        }
        let mine = Mine::new(statistics, cfg.criterion, cfg.ema_decay, cfg.seed)?;
        let trainer = Trainer::new(
            classifier,
            mine,
            cfg.build_classifier_optimizer()?,
            cfg.build_estimator_optimizer()?,
            cfg.schedule(),
            cfg.bottleneck_gradient(),
        )?
        .with_adaptive_clip(cfg.adaptive_clip)
        .with_persist_ema(cfg.persist_ema);
        Ok(trainer)
    }
}

impl<C, S, P> Trainer<C, S, P>
where
    C: Classifier,
    S: StatisticsFunction,
    P: PhaseSelector,
{
    pub fn new(
        classifier: C,
        mine: Mine<S>,
        optim_clf: Optimizer,
        optim_mine: Optimizer,
        selector: P,
        z_gradient: BottleneckGradient,
    ) -> Result<Self> {
        if let BottleneckGradient::Reversed { beta } = z_gradient {
            GradientReversal::new(beta)?;
        }
        Ok(Self {
            classifier,
            mine,
            optim_clf,
            optim_mine,
            selector,
            z_gradient,
            adaptive_clip: false,
            persist_ema: true,
            epoch: 0,
            global_step: 0,
            best_val_error: None,
            metrics: EpochMetrics::default(),
        })
    }

    pub fn with_adaptive_clip(mut self, on: bool) -> Self {
        self.adaptive_clip = on;
        self
    }

    pub fn with_persist_ema(mut self, on: bool) -> Self {
        self.persist_ema = on;
        self
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn mine(&self) -> &Mine<S> {
        &self.mine
    }

    pub fn mine_mut(&mut self) -> &mut Mine<S> {
        &mut self.mine
    }

    pub fn metrics(&self) -> &EpochMetrics {
        &self.metrics
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn best_validation_error(&self) -> Option<f32> {
        self.best_val_error
    }

    /// One minibatch of the alternating scheme.
    pub fn train_step(
        &mut self,
        x: &ArrayView2<f32>,
        y_true: &[usize],
        step_in_epoch: usize,
    ) -> Result<StepReport> {
        let out = self.classifier.forward(x)?;
        let (xent, d_logits) = cross_entropy(&out.logits.view(), y_true)?;
        self.metrics
            .train_accuracy
            .update_state(&out.logits.view(), y_true)?;
        self.metrics.xent.update_repeated(xent, y_true.len());

        let (emi, loss_ib) = self.mine.estimate_on_batch(x, &out.z.view())?;
        self.metrics.emi.update_repeated(emi, y_true.len());

        let phase = self.selector.select(step_in_epoch, self.epoch);
        let mut clip = None;
        match phase {
            Phase::Classifier => {
                let policy = self.z_gradient;
                let classifier = &mut self.classifier;
                let mine = &mut self.mine;
                self.optim_clf.zero_grad(classifier);

                if self.adaptive_clip && policy != BottleneckGradient::Detached {
                    let zero_logits = Array2::<f32>::zeros(out.logits.dim());
                    let mut main = |c: &mut C| c.backward(&out.cache, &d_logits.view(), None);
                    let mut sub = |c: &mut C| {
                        let dz = route_bottleneck_grad(policy, mine.backward(&loss_ib))?;
                        let dz_view = dz.as_ref().map(|a| a.view());
                        c.backward(&out.cache, &zero_logits.view(), dz_view.as_ref())
                    };
                    clip = Some(adaptive_clipping(&mut main, &mut sub, classifier)?);
                } else {
                    // The statistics function also receives this gradient; it is discarded
                    // because its optimizer does not step in this phase.
                    let dz = route_bottleneck_grad(policy, mine.backward(&loss_ib))?;
                    let dz_view = dz.as_ref().map(|a| a.view());
                    classifier.backward(&out.cache, &d_logits.view(), dz_view.as_ref())?;
                }
                self.optim_clf.step(classifier)?;
            }
            Phase::Estimator => {
                let stats = self.mine.statistics_mut();
                self.optim_mine.zero_grad(stats);
                self.mine.backward(&loss_ib);
                self.optim_mine.step(self.mine.statistics_mut())?;
            }
        }
        self.global_step += 1;

        tracing::debug!(
            step = self.global_step,
            ?phase,
            xent,
            emi,
            loss_ib = loss_ib.value(),
            "train step"
        );
        Ok(StepReport {
            phase,
            classifier_stepped: phase == Phase::Classifier,
            estimator_stepped: phase == Phase::Estimator,
            xent,
            emi,
            loss_ib: loss_ib.value(),
            clip,
        })
    }

    /// Train over one pass of `batches`; resets the train-side metrics first.
    pub fn train_epoch<I>(&mut self, batches: I) -> Result<Vec<StepReport>>
    where
        I: IntoIterator<Item = (Array2<f32>, Vec<usize>)>,
    {
        self.metrics.train_accuracy.reset_state();
        self.metrics.xent.reset_state();
        self.metrics.emi.reset_state();
        let mut reports = Vec::new();
        for (step, (x, y)) in batches.into_iter().enumerate() {
            reports.push(self.train_step(&x.view(), &y, step)?);
        }
        Ok(reports)
    }

    /// Validation error in percent. No gradients are computed.
    pub fn validate<I>(&mut self, batches: I) -> Result<f32>
    where
        I: IntoIterator<Item = (Array2<f32>, Vec<usize>)>,
    {
        self.metrics.valid_accuracy.reset_state();
        for (x, y) in batches {
            let out = self.classifier.forward(&x.view())?;
            self.metrics
                .valid_accuracy
                .update_state(&out.logits.view(), &y)?;
        }
        Ok(error_percent(&self.metrics.valid_accuracy))
    }

    /// Train until `total_epochs` epochs are complete, saving a checkpoint whenever the
    /// validation error improves.
    pub fn fit(
        &mut self,
        train: &mut LabeledLoader,
        valid: &mut LabeledLoader,
        total_epochs: usize,
        checkpoint_path: Option<&Path>,
    ) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::new();
        while self.epoch < total_epochs {
            let steps = self.train_epoch(train.epoch())?.len();
            let valid_error = self.validate(valid.epoch())?;
            self.epoch += 1;

            let improved = self.best_val_error.map_or(true, |best| valid_error < best);
            if improved {
                self.best_val_error = Some(valid_error);
            }
            let best = self.best_val_error.unwrap_or(valid_error);

            let report = EpochReport {
                epoch: self.epoch,
                steps,
                train_error: error_percent(&self.metrics.train_accuracy),
                xent: self.metrics.xent.result(),
                emi: self.metrics.emi.result(),
                valid_error,
                best_valid_error: best,
                improved,
            };
            tracing::info!(
                epoch = report.epoch,
                total_epochs,
                train_error = report.train_error,
                xent = report.xent,
                emi = report.emi,
                valid_error = report.valid_error,
                best_valid_error = report.best_valid_error,
                "epoch done"
            );

            if improved {
                if let Some(path) = checkpoint_path {
                    self.checkpoint().save(path)?;
                    tracing::info!(path = %path.display(), "model saved");
                }
            }
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            epoch: self.epoch,
            best_validation_error: self.best_val_error,
            bottleneck_dim: self.classifier.bottleneck_dim(),
            global_step: self.global_step,
            classifier_optimizer: self.optim_clf.state_dict(),
            estimator_optimizer: self.optim_mine.state_dict(),
            classifier_params: self.classifier.snapshot(),
            statistics_params: self.mine.statistics().snapshot(),
            mine: self.persist_ema.then(|| self.mine.state()),
            statistics_noise: self.mine.statistics().noise_rng(),
        }
    }

    /// Restore everything in `ckpt`. Topology and optimizer mismatches are reported before
    /// any state is touched.
    pub fn restore(&mut self, ckpt: Checkpoint) -> Result<()> {
        ensure_bottleneck_dim(self.classifier.bottleneck_dim(), &ckpt)?;
        let clf_shapes: Vec<_> = self.classifier.params().iter().map(|p| p.value.dim()).collect();
        let ckpt_shapes: Vec<_> = ckpt.classifier_params.iter().map(|a| a.dim()).collect();
        if clf_shapes != ckpt_shapes {
            return Err(Error::Config("classifier topology does not match checkpoint".into()));
        }
        let stats_shapes: Vec<_> = self
            .mine
            .statistics()
            .params()
            .iter()
            .map(|p| p.value.dim())
            .collect();
        let ckpt_stats: Vec<_> = ckpt.statistics_params.iter().map(|a| a.dim()).collect();
        if stats_shapes != ckpt_stats {
            return Err(Error::Config("statistics topology does not match checkpoint".into()));
        }
        for (saved, current) in [
            (ckpt.classifier_optimizer.kind, self.optim_clf.kind()),
            (ckpt.estimator_optimizer.kind, self.optim_mine.kind()),
        ] {
            if saved != current {
                return Err(Error::Config(format!(
                    "checkpoint optimizer is {saved}, trainer uses {current}"
                )));
            }
        }

        self.classifier.load_snapshot(&ckpt.classifier_params)?;
        self.mine
            .statistics_mut()
            .load_snapshot(&ckpt.statistics_params)?;
        self.optim_clf.load_state_dict(ckpt.classifier_optimizer)?;
        self.optim_mine.load_state_dict(ckpt.estimator_optimizer)?;
        self.epoch = ckpt.epoch;
        self.best_val_error = ckpt.best_validation_error;
        self.global_step = ckpt.global_step;
        if let Some(rng) = ckpt.statistics_noise {
            self.mine.statistics_mut().set_noise_rng(rng);
        }
        match ckpt.mine {
            Some(state) => self.mine.load_state(state),
            None => {
                tracing::warn!("checkpoint has no MINE state; EMA bias correction restarts");
                self.mine.reset_ema();
            }
        }
        Ok(())
    }
}
