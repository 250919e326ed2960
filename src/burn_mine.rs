//! Burn-backed (opt-in) MINE.
//!
//! This module is **additive**: it expresses the estimator on burn's autodiff backend
//! without changing the default `ndarray`-only API surface of the crate.
//!
//! Semantics match [`crate::mine::Mine`]:
//! - marginal samples come from a seeded `ChaCha8Rng` shuffle of `z` along the batch axis,
//! - `mine-d` keeps an EMA of `mean(exp(T_m))` as a plain `f64`, so it never enters the graph,
//! - `mine-f` minimizes exactly the negated report.
//!
//! Gradient reversal is a tensor op here ([`gradient_reversal`]), usable between the
//! bottleneck and the statistics function.

use burn_core as burn;

use crate::mine::Criterion;
use crate::{Error, Result};
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Linear, LinearConfig, Relu};
use burn_optim::{AdamConfig, GradientsParams, LearningRate, Optimizer};
use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Default burn backend for this crate: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// Identity on the forward pass; multiplies the incoming gradient by `-beta`.
pub fn gradient_reversal<B: Backend, const D: usize>(x: Tensor<B, D>, beta: f64) -> Tensor<B, D> {
    let frozen = x.clone().detach();
    frozen.clone() + (x - frozen).mul_scalar(-beta)
}

/// A statistics function `T(x, z)` returning one value per row.
pub trait BurnStatistics<B: Backend> {
    fn forward(&self, x: Tensor<B, 2>, z: Tensor<B, 2>) -> Tensor<B, 1>;
}

/// `T(x, z) = L3(ReLU(L2(ReLU(L1([x, z])))))`.
#[derive(Module, Debug)]
pub struct BurnStatisticsMlp<B: Backend> {
    l1: Linear<B>,
    l2: Linear<B>,
    l3: Linear<B>,
}

impl<B: Backend> BurnStatisticsMlp<B> {
    pub fn new(device: &B::Device, dx: usize, dz: usize, hidden: usize) -> Self {
        Self {
            l1: LinearConfig::new(dx + dz, hidden).init(device),
            l2: LinearConfig::new(hidden, hidden).init(device),
            l3: LinearConfig::new(hidden, 1).init(device),
        }
    }
}

impl<B: Backend> BurnStatistics<B> for BurnStatisticsMlp<B> {
    fn forward(&self, x: Tensor<B, 2>, z: Tensor<B, 2>) -> Tensor<B, 1> {
        let n = x.dims()[0];
        let h = Relu.forward(self.l1.forward(Tensor::cat(vec![x, z], 1)));
        let h = Relu.forward(self.l2.forward(h));
        self.l3.forward(h).reshape([n])
    }
}

/// Estimator state for the burn path.
#[derive(Debug, Clone)]
pub struct BurnMine {
    criterion: Criterion,
    ema_decay: f64,
    ema_denominator: Option<f64>,
    rng: ChaCha8Rng,
}

impl BurnMine {
    pub fn new(criterion: Criterion, ema_decay: f64, seed: u64) -> Result<Self> {
        if !(ema_decay > 0.0 && ema_decay < 1.0) {
            return Err(Error::Domain("ema_decay must be in (0, 1)"));
        }
        Ok(Self {
            criterion,
            ema_decay,
            ema_denominator: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn ema_denominator(&self) -> Option<f64> {
        self.ema_denominator
    }

    /// `(eMI, loss)` for one batch; `loss` is a `[1]` tensor ready for `backward`.
    pub fn loss<B, M>(&mut self, stats: &M, x: Tensor<B, 2>, z: Tensor<B, 2>) -> Result<(f32, Tensor<B, 1>)>
    where
        B: Backend,
        M: BurnStatistics<B>,
    {
        let b = x.dims()[0];
        if z.dims()[0] != b {
            return Err(Error::Shape("x and z must have the same batch size"));
        }
        if b < 2 {
            return Err(Error::InsufficientBatch { batch: b });
        }

        let mut perm: Vec<i64> = (0..b as i64).collect();
        perm.shuffle(&mut self.rng);
        let idx = Tensor::<B, 1, Int>::from_data(TensorData::new(perm, [b]), &z.device());
        let z_marg = z.clone().select(0, idx);

        let t_joint = stats.forward(x.clone(), z);
        let t_marg = stats.forward(x, z_marg);
        let mean_joint = t_joint.mean();

        match self.criterion {
            Criterion::MineD => {
                let denom = t_marg.exp().mean();
                let denom_value = denom.clone().into_scalar().elem::<f64>();
                if !denom_value.is_finite() || denom_value <= 0.0 {
                    return Err(Error::NonFinite("mine-d marginal denominator"));
                }
                let ema = match self.ema_denominator {
                    None => denom_value,
                    Some(prev) => self.ema_decay * prev + (1.0 - self.ema_decay) * denom_value,
                };
                self.ema_denominator = Some(ema);

                let joint_value = mean_joint.clone().into_scalar().elem::<f64>();
                let emi = (joint_value - denom_value.ln()) as f32;
                let loss = (mean_joint - denom.div_scalar(ema)).neg();
                if !emi.is_finite() {
                    return Err(Error::NonFinite("MINE estimate"));
                }
                Ok((emi, loss))
            }
            Criterion::MineF => {
                let bound = mean_joint - t_marg.sub_scalar(1.0).exp().mean();
                let emi = bound.clone().into_scalar().elem::<f32>();
                if !emi.is_finite() {
                    return Err(Error::NonFinite("MINE estimate"));
                }
                Ok((emi, bound.neg()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BurnTrainConfig {
    pub hidden: usize,
    pub steps: usize,
    pub batch_size: usize,
    pub lr: LearningRate,
    pub ema_decay: f64,
    pub seed: u64,
}

impl Default for BurnTrainConfig {
    fn default() -> Self {
        Self {
            hidden: 64,
            steps: 500,
            batch_size: 128,
            lr: 1e-3,
            ema_decay: 0.99,
            seed: 0,
        }
    }
}

fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &Array2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

/// Estimator-only Adam loop on joint samples `(x, z)`. Returns the model and the per-step
/// eMI trace.
pub fn train_statistics_burn(
    device: &<BurnBackend as Backend>::Device,
    x: &Array2<f32>,
    z: &Array2<f32>,
    criterion: Criterion,
    cfg: &BurnTrainConfig,
) -> Result<(BurnStatisticsMlp<BurnBackend>, Vec<f32>)> {
    let n = x.nrows();
    if z.nrows() != n {
        return Err(Error::Shape("x and z must have the same number of rows"));
    }
    let batch = cfg.batch_size.min(n);
    if batch < 2 {
        return Err(Error::InsufficientBatch { batch });
    }

    let mut model = BurnStatisticsMlp::<BurnBackend>::new(device, x.ncols(), z.ncols(), cfg.hidden);
    let mut optim = AdamConfig::new().init::<BurnBackend, BurnStatisticsMlp<BurnBackend>>();
    let mut mine = BurnMine::new(criterion, cfg.ema_decay, cfg.seed)?;
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(1));
    let mut order: Vec<usize> = (0..n).collect();
    let mut trace = Vec::with_capacity(cfg.steps);

    for step in 0..cfg.steps {
        order.shuffle(&mut rng);
        let idx = &order[..batch];
        let xb = ndarray_to_burn_2::<BurnBackend>(device, &x.select(Axis(0), idx));
        let zb = ndarray_to_burn_2::<BurnBackend>(device, &z.select(Axis(0), idx));

        let (emi, loss) = mine.loss(&model, xb, zb)?;
        trace.push(emi);
        tracing::debug!(step, emi, "burn estimator step");

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(cfg.lr, model, grads);
    }

    Ok((model, trace))
}
