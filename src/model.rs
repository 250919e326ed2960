//! Bottleneck classifier: `x -> (logits, z)`.

use crate::nn::{relu, relu_backward, Linear};
use crate::param::{Param, Parameterized};
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Output of a classifier forward pass.
pub struct ClassifierOutput<C> {
    /// `[B, num_classes]`
    pub logits: Array2<f32>,
    /// Bottleneck representation, `[B, D]`.
    pub z: Array2<f32>,
    pub cache: C,
}

/// Contract for a classifier with an exposed bottleneck.
pub trait Classifier: Parameterized {
    type Cache;

    fn forward(&self, x: &ArrayView2<f32>) -> Result<ClassifierOutput<Self::Cache>>;

    /// Accumulate parameter gradients.
    ///
    /// `d_z` is the gradient arriving at the bottleneck from outside the classifier head
    /// (e.g. from the MI term). `None` means `z` was detached.
    fn backward(
        &mut self,
        cache: &Self::Cache,
        d_logits: &ArrayView2<f32>,
        d_z: Option<&ArrayView2<f32>>,
    ) -> Result<()>;

    fn bottleneck_dim(&self) -> usize;

    fn num_classes(&self) -> usize;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MlpClassifierConfig {
    pub input_dim: usize,
    pub hidden: usize,
    pub bottleneck_dim: usize,
    pub num_classes: usize,
    pub seed: u64,
}

/// `x -> ReLU(L1 x) -> z = L2 h -> logits = L3 z`.
#[derive(Debug, Clone)]
pub struct MlpClassifier {
    encoder: Linear,
    bottleneck: Linear,
    head: Linear,
}

pub struct MlpClassifierCache {
    x: Array2<f32>,
    pre1: Array2<f32>,
    h1: Array2<f32>,
    z: Array2<f32>,
}

impl MlpClassifier {
    pub fn new(cfg: &MlpClassifierConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        Self {
            encoder: Linear::new(cfg.input_dim, cfg.hidden, &mut rng),
            bottleneck: Linear::new(cfg.hidden, cfg.bottleneck_dim, &mut rng),
            head: Linear::new(cfg.bottleneck_dim, cfg.num_classes, &mut rng),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.encoder.d_in()
    }
}

impl Parameterized for MlpClassifier {
    fn params(&self) -> Vec<&Param> {
        let mut out = Vec::with_capacity(6);
        out.extend(self.encoder.params());
        out.extend(self.bottleneck.params());
        out.extend(self.head.params());
        out
    }
    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut out = Vec::with_capacity(6);
        out.extend(self.encoder.params_mut());
        out.extend(self.bottleneck.params_mut());
        out.extend(self.head.params_mut());
        out
    }
}

impl Classifier for MlpClassifier {
    type Cache = MlpClassifierCache;

    fn forward(&self, x: &ArrayView2<f32>) -> Result<ClassifierOutput<MlpClassifierCache>> {
        if x.ncols() != self.input_dim() {
            return Err(Error::Shape("x has the wrong feature dimension"));
        }
        let pre1 = self.encoder.forward(x);
        let h1 = relu(&pre1);
        let z = self.bottleneck.forward(&h1.view());
        let logits = self.head.forward(&z.view());
        Ok(ClassifierOutput {
            logits,
            z: z.clone(),
            cache: MlpClassifierCache {
                x: x.to_owned(),
                pre1,
                h1,
                z,
            },
        })
    }

    fn backward(
        &mut self,
        cache: &MlpClassifierCache,
        d_logits: &ArrayView2<f32>,
        d_z: Option<&ArrayView2<f32>>,
    ) -> Result<()> {
        let mut dz = self.head.backward(&cache.z.view(), d_logits);
        if let Some(extra) = d_z {
            if extra.dim() != dz.dim() {
                return Err(Error::Shape("d_z must match the bottleneck shape"));
            }
            dz += extra;
        }
        let dh1 = self.bottleneck.backward(&cache.h1.view(), &dz.view());
        let dpre1 = relu_backward(&cache.pre1, &dh1.view());
        self.encoder.backward(&cache.x.view(), &dpre1.view());
        Ok(())
    }

    fn bottleneck_dim(&self) -> usize {
        self.bottleneck.d_out()
    }

    fn num_classes(&self) -> usize {
        self.head.d_out()
    }
}
