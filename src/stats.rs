//! Statistics functions `T(x, z) -> R` used by the MINE estimator.
//!
//! A statistics function scores each `(x_i, z_i)` pair with one real number. It must be
//! differentiable w.r.t. its own parameters and w.r.t. `z`; here that means a `backward`
//! that accumulates parameter gradients and returns `dL/dz`.

use crate::nn::{relu, relu_backward, Linear};
use crate::param::{Param, Parameterized};
use crate::{Error, Result};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Contract for `T(x, z)`.
pub trait StatisticsFunction: Parameterized {
    /// Whatever the backward pass needs from the forward pass.
    type Cache;

    /// Per-sample statistics, shape `[B]`.
    fn forward(&mut self, x: &ArrayView2<f32>, z: &ArrayView2<f32>)
        -> Result<(Array1<f32>, Self::Cache)>;

    /// Accumulate parameter gradients for upstream `dL/dT` and return `dL/dz` (`[B, D_z]`).
    fn backward(&mut self, cache: &Self::Cache, d_out: &ArrayView1<f32>) -> Array2<f32>;

    /// Train/eval switch. Eval must be deterministic.
    fn set_train(&mut self, train: bool);

    fn is_train(&self) -> bool;

    /// RNG behind train-mode randomness, if any. Checkpoints store it so a resumed run
    /// draws the same noise as an uninterrupted one.
    fn noise_rng(&self) -> Option<ChaCha8Rng> {
        None
    }

    fn set_noise_rng(&mut self, _rng: ChaCha8Rng) {}
}

fn check_pair(x: &ArrayView2<f32>, z: &ArrayView2<f32>, dx: usize, dz: usize) -> Result<()> {
    if x.nrows() != z.nrows() {
        return Err(Error::Shape("x and z must have the same number of rows"));
    }
    if x.ncols() != dx {
        return Err(Error::Shape("x has the wrong feature dimension"));
    }
    if z.ncols() != dz {
        return Err(Error::Shape("z has the wrong feature dimension"));
    }
    Ok(())
}

// =============================================================================
// Bilinear: T(x, z) = xᵀ W z + b
// =============================================================================

/// `T(x, z) = xᵀ W z + b`.
///
/// With `W = I` and `b = 0` this is the plain dot product `x·z`. Initialized at zero,
/// so an untrained estimator reports `eMI = 0` (DV) or `-1/e` (NWJ).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BilinearStatistics {
    pub w: Param,
    pub b: Param,
    #[serde(skip, default = "default_train")]
    train: bool,
}

fn default_train() -> bool {
    true
}

pub struct BilinearCache {
    x: Array2<f32>,
    z: Array2<f32>,
}

impl BilinearStatistics {
    pub fn zeros(dx: usize, dz: usize) -> Self {
        Self {
            w: Param::new(Array2::zeros((dx, dz))),
            b: Param::new(Array2::zeros((1, 1))),
            train: true,
        }
    }

    /// `W = I` (requires `dx == dz`), i.e. `T = x·z`.
    pub fn dot_product(d: usize) -> Self {
        let mut out = Self::zeros(d, d);
        out.w.value = Array2::eye(d);
        out
    }
}

impl Parameterized for BilinearStatistics {
    fn params(&self) -> Vec<&Param> {
        vec![&self.w, &self.b]
    }
    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }
}

impl StatisticsFunction for BilinearStatistics {
    type Cache = BilinearCache;

    fn forward(
        &mut self,
        x: &ArrayView2<f32>,
        z: &ArrayView2<f32>,
    ) -> Result<(Array1<f32>, BilinearCache)> {
        let (dx, dz) = self.w.value.dim();
        check_pair(x, z, dx, dz)?;
        // (x W) ⊙ z, summed per row.
        let xw = x.dot(&self.w.value);
        let t = (&xw * z).sum_axis(Axis(1)) + self.b.value[[0, 0]];
        Ok((
            t,
            BilinearCache {
                x: x.to_owned(),
                z: z.to_owned(),
            },
        ))
    }

    fn backward(&mut self, cache: &BilinearCache, d_out: &ArrayView1<f32>) -> Array2<f32> {
        let d_col = d_out.view().insert_axis(Axis(1));
        // dW = Σ_i d_i x_iᵀ z_i
        let dw = (&cache.x * &d_col).t().dot(&cache.z);
        let db = Array2::from_elem((1, 1), d_out.sum());
        self.w.accumulate_grad(&dw);
        self.b.accumulate_grad(&db);
        // dT_i/dz_i = x_i W
        cache.x.dot(&self.w.value) * &d_col
    }

    fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    fn is_train(&self) -> bool {
        self.train
    }
}

// =============================================================================
// MLP over [x, z]
// =============================================================================

/// Configuration for [`MlpStatistics`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MlpStatisticsConfig {
    pub dx: usize,
    pub dz: usize,
    pub hidden: usize,
    /// Std of additive Gaussian noise on `z` in train mode (0 disables it).
    pub noise_std: f32,
    pub seed: u64,
}

impl Default for MlpStatisticsConfig {
    fn default() -> Self {
        Self {
            dx: 1,
            dz: 1,
            hidden: 64,
            noise_std: 0.0,
            seed: 0,
        }
    }
}

/// Three-layer ReLU network on the concatenation `[x, z]`.
///
/// In train mode `z` is perturbed by additive noise before scoring; the noise is an
/// additive constant, so `dT/dz` is unaffected.
#[derive(Debug, Clone)]
pub struct MlpStatistics {
    l1: Linear,
    l2: Linear,
    l3: Linear,
    dx: usize,
    dz: usize,
    noise_std: f32,
    train: bool,
    rng: ChaCha8Rng,
}

pub struct MlpCache {
    input: Array2<f32>,
    pre1: Array2<f32>,
    h1: Array2<f32>,
    pre2: Array2<f32>,
    h2: Array2<f32>,
}

impl MlpStatistics {
    pub fn new(cfg: &MlpStatisticsConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let l1 = Linear::new(cfg.dx + cfg.dz, cfg.hidden, &mut rng);
        let l2 = Linear::new(cfg.hidden, cfg.hidden, &mut rng);
        let l3 = Linear::new(cfg.hidden, 1, &mut rng);
        Self {
            l1,
            l2,
            l3,
            dx: cfg.dx,
            dz: cfg.dz,
            noise_std: cfg.noise_std,
            train: true,
            rng,
        }
    }
}

impl Parameterized for MlpStatistics {
    fn params(&self) -> Vec<&Param> {
        let mut out = Vec::with_capacity(6);
        out.extend(self.l1.params());
        out.extend(self.l2.params());
        out.extend(self.l3.params());
        out
    }
    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut out = Vec::with_capacity(6);
        out.extend(self.l1.params_mut());
        out.extend(self.l2.params_mut());
        out.extend(self.l3.params_mut());
        out
    }
}

impl StatisticsFunction for MlpStatistics {
    type Cache = MlpCache;

    fn forward(
        &mut self,
        x: &ArrayView2<f32>,
        z: &ArrayView2<f32>,
    ) -> Result<(Array1<f32>, MlpCache)> {
        check_pair(x, z, self.dx, self.dz)?;
        let mut z_in = z.to_owned();
        if self.train && self.noise_std > 0.0 {
            let std = self.noise_std;
            let rng = &mut self.rng;
            z_in.mapv_inplace(|v| {
                let e: f32 = StandardNormal.sample(&mut *rng);
                v + std * e
            });
        }
        let input = concatenate(Axis(1), &[x.view(), z_in.view()])
            .map_err(|_| Error::Shape("failed to concatenate x and z"))?;

        let pre1 = self.l1.forward(&input.view());
        let h1 = relu(&pre1);
        let pre2 = self.l2.forward(&h1.view());
        let h2 = relu(&pre2);
        let out = self.l3.forward(&h2.view());
        let t = out.column(0).to_owned();

        Ok((
            t,
            MlpCache {
                input,
                pre1,
                h1,
                pre2,
                h2,
            },
        ))
    }

    fn backward(&mut self, cache: &MlpCache, d_out: &ArrayView1<f32>) -> Array2<f32> {
        let d3 = d_out.view().insert_axis(Axis(1));
        let dh2 = self.l3.backward(&cache.h2.view(), &d3);
        let dpre2 = relu_backward(&cache.pre2, &dh2.view());
        let dh1 = self.l2.backward(&cache.h1.view(), &dpre2.view());
        let dpre1 = relu_backward(&cache.pre1, &dh1.view());
        let dinput = self.l1.backward(&cache.input.view(), &dpre1.view());
        dinput.slice(s![.., self.dx..]).to_owned()
    }

    fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    fn is_train(&self) -> bool {
        self.train
    }

    fn noise_rng(&self) -> Option<ChaCha8Rng> {
        Some(self.rng.clone())
    }

    fn set_noise_rng(&mut self, rng: ChaCha8Rng) {
        self.rng = rng;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_dz<S: StatisticsFunction>(s: &mut S, x: &Array2<f32>, z: &Array2<f32>) -> Array2<f32> {
        let eps = 1e-3f32;
        let mut out = Array2::<f32>::zeros(z.dim());
        for i in 0..z.nrows() {
            for k in 0..z.ncols() {
                let mut zp = z.clone();
                zp[[i, k]] += eps;
                let mut zm = z.clone();
                zm[[i, k]] -= eps;
                let (tp, _) = s.forward(&x.view(), &zp.view()).unwrap();
                let (tm, _) = s.forward(&x.view(), &zm.view()).unwrap();
                out[[i, k]] = (tp.sum() - tm.sum()) / (2.0 * eps);
            }
        }
        out
    }

    #[test]
    fn dot_product_statistics_is_rowwise_dot() {
        let mut s = BilinearStatistics::dot_product(2);
        let x = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let z = Array2::from_shape_vec((2, 2), vec![0.5, 1.0, -1.0, 0.0]).unwrap();
        let (t, _) = s.forward(&x.view(), &z.view()).unwrap();
        assert_eq!(t.to_vec(), vec![2.5, -3.0]);
    }

    #[test]
    fn bilinear_backward_returns_dz() {
        let mut s = BilinearStatistics::zeros(2, 3);
        s.w.value = Array2::from_shape_fn((2, 3), |(i, j)| 0.1 * (i + 2 * j) as f32 - 0.2);
        let x = Array2::from_shape_fn((3, 2), |(i, j)| (i as f32) - (j as f32) * 0.5);
        let z = Array2::from_shape_fn((3, 3), |(i, j)| 0.3 * (i * j) as f32 - 0.1);
        let (_, cache) = s.forward(&x.view(), &z.view()).unwrap();
        let ones = Array1::<f32>::ones(3);
        let dz = s.backward(&cache, &ones.view());
        let fd = fd_dz(&mut s, &x, &z);
        for (a, b) in dz.iter().zip(fd.iter()) {
            assert!((a - b).abs() < 1e-3, "analytic={a} fd={b}");
        }
        assert_eq!(s.b.grad.as_ref().unwrap()[[0, 0]], 3.0);
    }

    #[test]
    fn mlp_backward_returns_dz_in_eval_mode() {
        let cfg = MlpStatisticsConfig {
            dx: 2,
            dz: 2,
            hidden: 8,
            noise_std: 0.5,
            seed: 3,
        };
        let mut s = MlpStatistics::new(&cfg);
        s.set_train(false);
        let x = Array2::from_shape_fn((4, 2), |(i, j)| 0.2 * i as f32 - 0.3 * j as f32);
        let z = Array2::from_shape_fn((4, 2), |(i, j)| 0.1 * (i + j) as f32 - 0.2);
        let (_, cache) = s.forward(&x.view(), &z.view()).unwrap();
        let ones = Array1::<f32>::ones(4);
        let dz = s.backward(&cache, &ones.view());
        assert_eq!(dz.dim(), (4, 2));
        let fd = fd_dz(&mut s, &x, &z);
        for (a, b) in dz.iter().zip(fd.iter()) {
            assert!((a - b).abs() < 5e-3, "analytic={a} fd={b}");
        }
    }

    #[test]
    fn train_mode_noise_only_applies_in_train() {
        let cfg = MlpStatisticsConfig {
            dx: 1,
            dz: 1,
            hidden: 4,
            noise_std: 1.0,
            seed: 1,
        };
        let mut s = MlpStatistics::new(&cfg);
        let x = Array2::<f32>::ones((3, 1));
        let z = Array2::<f32>::ones((3, 1));

        s.set_train(false);
        let (a, _) = s.forward(&x.view(), &z.view()).unwrap();
        let (b, _) = s.forward(&x.view(), &z.view()).unwrap();
        assert_eq!(a, b);

        s.set_train(true);
        let (c, _) = s.forward(&x.view(), &z.view()).unwrap();
        let (d, _) = s.forward(&x.view(), &z.view()).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut s = BilinearStatistics::zeros(2, 2);
        let x = Array2::<f32>::zeros((3, 2));
        let z = Array2::<f32>::zeros((2, 2));
        assert!(matches!(
            s.forward(&x.view(), &z.view()),
            Err(Error::Shape(_))
        ));
    }
}
