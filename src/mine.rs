//! Mutual Information Neural Estimation (MINE).
//!
//! Given a statistics function \(T_\theta(x, z)\) and a minibatch of joint samples
//! \((x_i, z_i)\), MINE estimates \(I(X; Z)\) with a variational lower bound. The marginal
//! term is approximated by pairing each \(x_i\) with \(z_{\pi(i)}\) for a fresh uniform
//! permutation \(\pi\).
//!
//! Two criteria are supported:
//!
//! - [`Criterion::MineD`] (Donsker–Varadhan):
//!   \(\hat I = \bar T_{joint} - \log \overline{e^{T_{marg}}}\).
//!   Differentiating the `log` of a minibatch mean gives a biased gradient, so the loss that
//!   is actually differentiated replaces it with \(\overline{e^{T_{marg}}} / \mathrm{EMA}\),
//!   where the EMA of past denominators is a constant for the current step.
//!   The reported value and the loss are therefore *different* functionals of the batch.
//! - [`Criterion::MineF`] (NWJ / f-divergence):
//!   \(\hat I = \bar T_{joint} - \overline{e^{T_{marg} - 1}}\), loss \(= -\hat I\).
//!
//! ## Public invariants
//!
//! - The criterion is fixed at construction.
//! - Batches need `B >= 2`; with `B = 1` the permutation is the identity and the marginal
//!   sample equals the joint sample, so we refuse instead of reporting ~0.
//! - Permutations come from an owned, seeded `ChaCha8Rng`; the RNG and the EMA are exposed
//!   as [`MineState`] so a resumed run continues bit-for-bit.

use crate::data::PairedLoader;
use crate::stats::StatisticsFunction;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which variational bound the estimator optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    /// Donsker–Varadhan bound with EMA gradient correction.
    #[serde(rename = "mine-d")]
    MineD,
    /// NWJ (f-divergence) bound.
    #[serde(rename = "mine-f")]
    MineF,
}

impl FromStr for Criterion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mine-d" => Ok(Self::MineD),
            "mine-f" => Ok(Self::MineF),
            other => Err(Error::Config(format!(
                "unknown criterion {other:?} (expected \"mine-d\" or \"mine-f\")"
            ))),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MineD => f.write_str("mine-d"),
            Self::MineF => f.write_str("mine-f"),
        }
    }
}

/// Resumable estimator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MineState {
    /// EMA of `mean(exp(T_marg))`; `None` before the first `mine-d` batch.
    pub ema_denominator: Option<f64>,
    /// Permutation source.
    pub rng: ChaCha8Rng,
}

/// A differentiable MINE loss for one batch.
///
/// Holds everything needed to backpropagate, so [`Mine::backward`] may be called more than
/// once on the same loss (each call accumulates gradients again).
pub struct MineLoss<C> {
    value: f32,
    denominator: Option<f64>,
    joint: C,
    margin: C,
    /// `dL/dT_joint`
    d_joint: Array1<f32>,
    /// `dL/dT_marg`
    d_margin: Array1<f32>,
    perm: Vec<usize>,
}

impl<C> MineLoss<C> {
    /// Scalar loss value (the quantity whose gradient [`Mine::backward`] computes).
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Batch denominator `mean(exp(T_marg))` (`mine-d` only).
    pub fn denominator(&self) -> Option<f64> {
        self.denominator
    }

    /// Marginal permutation used for this batch: `z_marg[i] = z[perm[i]]`.
    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }
}

/// Result of [`Mine::estimate_on_cursors`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetEstimate {
    pub emi: f32,
    /// Number of aligned batch pairs that were accumulated.
    pub batches: usize,
    pub samples: usize,
}

/// The MINE engine: owns the statistics function and the EMA/RNG state.
#[derive(Debug, Clone)]
pub struct Mine<S> {
    stats: S,
    criterion: Criterion,
    ema_decay: f64,
    ema_denominator: Option<f64>,
    rng: ChaCha8Rng,
}

/// `log(mean(exp(v)))`, max-shifted.
fn log_mean_exp(v: &ArrayView1<f32>) -> f64 {
    let m = v.fold(f32::NEG_INFINITY, |a, &b| a.max(b)) as f64;
    let s: f64 = v.iter().map(|&t| (t as f64 - m).exp()).sum();
    m + (s / v.len() as f64).ln()
}

fn mean(v: &ArrayView1<f32>) -> f64 {
    v.iter().map(|&t| t as f64).sum::<f64>() / v.len() as f64
}

impl<S: StatisticsFunction> Mine<S> {
    /// `ema_decay` must lie in `(0, 1)`.
    pub fn new(stats: S, criterion: Criterion, ema_decay: f64, seed: u64) -> Result<Self> {
        if !(ema_decay > 0.0 && ema_decay < 1.0) {
            return Err(Error::Domain("ema_decay must be in (0, 1)"));
        }
        Ok(Self {
            stats,
            criterion,
            ema_decay,
            ema_denominator: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn ema_decay(&self) -> f64 {
        self.ema_decay
    }

    pub fn ema_denominator(&self) -> Option<f64> {
        self.ema_denominator
    }

    pub fn statistics(&self) -> &S {
        &self.stats
    }

    pub fn statistics_mut(&mut self) -> &mut S {
        &mut self.stats
    }

    pub fn into_statistics(self) -> S {
        self.stats
    }

    pub fn state(&self) -> MineState {
        MineState {
            ema_denominator: self.ema_denominator,
            rng: self.rng.clone(),
        }
    }

    pub fn load_state(&mut self, state: MineState) {
        self.ema_denominator = state.ema_denominator;
        self.rng = state.rng;
    }

    /// Drop the EMA (the next `mine-d` batch re-initializes it).
    pub fn reset_ema(&mut self) {
        self.ema_denominator = None;
    }

    /// Estimate MI on one batch of joint samples and build the loss to minimize.
    ///
    /// Puts the statistics function in train mode. Returns `(eMI, loss)`; `eMI` is for
    /// monitoring only.
    pub fn estimate_on_batch(
        &mut self,
        x: &ArrayView2<f32>,
        z: &ArrayView2<f32>,
    ) -> Result<(f32, MineLoss<S::Cache>)> {
        let b = x.nrows();
        if z.nrows() != b {
            return Err(Error::Shape("x and z must have the same batch size"));
        }
        if b < 2 {
            return Err(Error::InsufficientBatch { batch: b });
        }
        self.stats.set_train(true);

        let mut perm: Vec<usize> = (0..b).collect();
        perm.shuffle(&mut self.rng);
        let z_marg = z.select(Axis(0), &perm);

        let (t_joint, joint) = self.stats.forward(x, z)?;
        let (t_margin, margin) = self.stats.forward(x, &z_marg.view())?;
        if t_joint.len() != b || t_margin.len() != b {
            return Err(Error::Shape("statistics function must return one value per sample"));
        }

        let bf = b as f64;
        let mean_joint = mean(&t_joint.view());
        let d_joint = Array1::from_elem(b, (-1.0 / bf) as f32);

        let (emi, value, denominator, ema, d_margin) = match self.criterion {
            Criterion::MineD => {
                let lme = log_mean_exp(&t_margin.view());
                let denominator = lme.exp();
                if !denominator.is_finite() || denominator <= 0.0 {
                    return Err(Error::NonFinite("mine-d marginal denominator"));
                }

                let ema = match self.ema_denominator {
                    None => denominator,
                    Some(prev) => self.ema_decay * prev + (1.0 - self.ema_decay) * denominator,
                };

                let emi = (mean_joint - lme) as f32;
                let value = (-(mean_joint - denominator / ema)) as f32;
                // d/dT_i of mean(exp(T))/ema = exp(T_i) / (B * ema)
                let log_ema = ema.ln();
                let d_margin = t_margin.mapv(|t| ((t as f64 - log_ema).exp() / bf) as f32);
                (emi, value, Some(denominator), Some(ema), d_margin)
            }
            Criterion::MineF => {
                let penalty = t_margin
                    .iter()
                    .map(|&t| (t as f64 - 1.0).exp())
                    .sum::<f64>()
                    / bf;
                let emi = (mean_joint - penalty) as f32;
                let d_margin = t_margin.mapv(|t| ((t as f64 - 1.0).exp() / bf) as f32);
                (emi, -emi, None, None, d_margin)
            }
        };

        if !emi.is_finite() || !value.is_finite() {
            return Err(Error::NonFinite("MINE estimate"));
        }
        if ema.is_some() {
            self.ema_denominator = ema;
        }

        Ok((
            emi,
            MineLoss {
                value,
                denominator,
                joint,
                margin,
                d_joint,
                d_margin,
                perm,
            },
        ))
    }

    /// Backpropagate `loss` into the statistics function's gradient buffers.
    ///
    /// Returns `dL/dz` for the joint `z` (the marginal branch is scattered back through the
    /// permutation). Callers that detach `z` simply drop it.
    pub fn backward(&mut self, loss: &MineLoss<S::Cache>) -> Array2<f32> {
        self.backward_scaled(loss, 1.0)
    }

    /// Backpropagate `scale * loss`.
    pub fn backward_scaled(&mut self, loss: &MineLoss<S::Cache>, scale: f32) -> Array2<f32> {
        let d_joint = &loss.d_joint * scale;
        let d_margin = &loss.d_margin * scale;
        let mut dz = self.stats.backward(&loss.joint, &d_joint.view());
        let dz_margin = self.stats.backward(&loss.margin, &d_margin.view());
        for (i, &p) in loss.perm.iter().enumerate() {
            let mut row = dz.row_mut(p);
            row += &dz_margin.row(i);
        }
        dz
    }

    /// Whole-dataset DV estimate: joint batches from [`PairedLoader::cursor`], marginal `z`
    /// from [`PairedLoader::marginal_cursor`].
    ///
    /// See [`Self::estimate_on_cursors`] for the pairing and truncation rules.
    pub fn estimate_on_dataset<L: PairedLoader + ?Sized>(&mut self, loader: &mut L) -> Result<f32> {
        let joint = loader.cursor();
        let marginal = loader.marginal_cursor();
        Ok(self.estimate_on_cursors(joint, marginal)?.emi)
    }

    /// Evaluation-only DV estimate over aligned batches from two cursors.
    ///
    /// `x` and `z` come from the joint cursor; `z_marginal` comes from the marginal cursor.
    /// Accumulation stops as soon as either cursor is exhausted, and a trailing pair whose
    /// batch sizes differ is discarded. Puts the statistics function in eval mode.
    pub fn estimate_on_cursors<J, M>(&mut self, joint: J, marginal: M) -> Result<DatasetEstimate>
    where
        J: IntoIterator<Item = (Array2<f32>, Array2<f32>)>,
        M: IntoIterator<Item = (Array2<f32>, Array2<f32>)>,
    {
        self.stats.set_train(false);

        let mut term1 = 0.0f64;
        // Running log(Σ exp(T_marg)).
        let mut log_term2 = f64::NEG_INFINITY;
        let mut samples = 0usize;
        let mut batches = 0usize;

        for ((x, z), (_, z_marginal)) in joint.into_iter().zip(marginal) {
            if z_marginal.nrows() != x.nrows() {
                break;
            }
            let (t_joint, _) = self.stats.forward(&x.view(), &z.view())?;
            let (t_marg, _) = self.stats.forward(&x.view(), &z_marginal.view())?;

            term1 += t_joint.iter().map(|&t| t as f64).sum::<f64>();
            let batch_lme = log_mean_exp(&t_marg.view()) + (t_marg.len() as f64).ln();
            log_term2 = log_add_exp(log_term2, batch_lme);
            samples += t_joint.len();
            batches += 1;
        }

        if samples == 0 {
            return Err(Error::Domain("no aligned batches to estimate on"));
        }
        let n = samples as f64;
        let emi = (term1 / n - (log_term2 - n.ln())) as f32;
        if !emi.is_finite() {
            return Err(Error::NonFinite("dataset MI estimate"));
        }
        Ok(DatasetEstimate {
            emi,
            batches,
            samples,
        })
    }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}
