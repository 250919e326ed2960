//! In-memory loaders and synthetic datasets.
//!
//! Loaders are deterministic given a seed: every call to `cursor`/`epoch` draws a fresh
//! shuffle from the loader's own `ChaCha8Rng`.

use crate::{Error, Result};
use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::Arc;

/// A source of aligned `(x, z)` batches that can hand out independent cursors.
pub trait PairedLoader {
    type Cursor: Iterator<Item = (Array2<f32>, Array2<f32>)>;

    /// A new pass over the data. Cursors are independent of each other.
    fn cursor(&mut self) -> Self::Cursor;

    /// A pass whose `z` rows are decoupled from [`Self::cursor`]'s order, used to draw
    /// marginal samples. Must be shuffled even when the joint cursor is not.
    fn marginal_cursor(&mut self) -> Self::Cursor;
}

/// Joint samples `(x_i, z_i)` held in memory.
#[derive(Debug, Clone)]
pub struct PairedDataset {
    data: Arc<(Array2<f32>, Array2<f32>)>,
    batch_size: usize,
    shuffle: bool,
    rng: ChaCha8Rng,
}

impl PairedDataset {
    pub fn new(x: Array2<f32>, z: Array2<f32>, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if x.nrows() != z.nrows() {
            return Err(Error::Shape("x and z must have the same number of rows"));
        }
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        Ok(Self {
            data: Arc::new((x, z)),
            batch_size,
            shuffle,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.data.0.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PairedCursor {
    data: Arc<(Array2<f32>, Array2<f32>)>,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
}

impl Iterator for PairedCursor {
    type Item = (Array2<f32>, Array2<f32>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let idx = &self.order[self.pos..end];
        self.pos = end;
        Some((
            self.data.0.select(Axis(0), idx),
            self.data.1.select(Axis(0), idx),
        ))
    }
}

impl PairedDataset {
    fn pass(&mut self, shuffle: bool) -> PairedCursor {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(&mut self.rng);
        }
        PairedCursor {
            data: Arc::clone(&self.data),
            order,
            pos: 0,
            batch_size: self.batch_size,
        }
    }
}

impl PairedLoader for PairedDataset {
    type Cursor = PairedCursor;

    fn cursor(&mut self) -> PairedCursor {
        self.pass(self.shuffle)
    }

    fn marginal_cursor(&mut self) -> PairedCursor {
        self.pass(true)
    }
}

/// Inputs with integer class labels.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    pub x: Array2<f32>,
    pub y: Vec<usize>,
}

impl LabeledDataset {
    pub fn new(x: Array2<f32>, y: Vec<usize>) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(Error::Shape("labels length must match x.nrows()"));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Minibatch loader over a [`LabeledDataset`].
#[derive(Debug, Clone)]
pub struct LabeledLoader {
    data: LabeledDataset,
    batch_size: usize,
    shuffle: bool,
    /// Skip a final batch smaller than `batch_size`.
    drop_last: bool,
    rng: ChaCha8Rng,
}

impl LabeledLoader {
    pub fn new(data: LabeledDataset, batch_size: usize, shuffle: bool, drop_last: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        Ok(Self {
            data,
            batch_size,
            shuffle,
            drop_last,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn dataset(&self) -> &LabeledDataset {
        &self.data
    }

    /// One pass over the data.
    pub fn epoch(&mut self) -> LabeledBatches<'_> {
        let mut order: Vec<usize> = (0..self.data.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        if self.drop_last {
            let keep = order.len() - order.len() % self.batch_size;
            order.truncate(keep);
        }
        LabeledBatches {
            data: &self.data,
            order,
            pos: 0,
            batch_size: self.batch_size,
        }
    }
}

pub struct LabeledBatches<'a> {
    data: &'a LabeledDataset,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
}

impl Iterator for LabeledBatches<'_> {
    type Item = (Array2<f32>, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let idx = &self.order[self.pos..end];
        self.pos = end;
        let x = self.data.x.select(Axis(0), idx);
        let y = idx.iter().map(|&i| self.data.y[i]).collect();
        Some((x, y))
    }
}

// =============================================================================
// Synthetic data
// =============================================================================

/// `x ~ N(0, I_d)`, `z = x + noise_std * ε` with `ε ~ N(0, I_d)`.
pub fn correlated_gaussians(n: usize, d: usize, noise_std: f32, seed: u64) -> (Array2<f32>, Array2<f32>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x = Array2::<f32>::zeros((n, d));
    let mut z = Array2::<f32>::zeros((n, d));
    for i in 0..n {
        for k in 0..d {
            let xv: f32 = StandardNormal.sample(&mut rng);
            let e: f32 = StandardNormal.sample(&mut rng);
            x[[i, k]] = xv;
            z[[i, k]] = xv + noise_std * e;
        }
    }
    (x, z)
}

/// Closed-form `I(X; Z)` in nats for [`correlated_gaussians`].
pub fn gaussian_mi(d: usize, noise_std: f32) -> f64 {
    let s2 = (noise_std as f64).powi(2);
    0.5 * d as f64 * (1.0 + 1.0 / s2).ln()
}

/// Isotropic Gaussian blobs: class `c` is centred at `±separation` on axis `c % dim`.
pub fn gaussian_blobs(
    n: usize,
    num_classes: usize,
    dim: usize,
    separation: f32,
    seed: u64,
) -> Result<LabeledDataset> {
    if num_classes == 0 || dim == 0 {
        return Err(Error::Domain("num_classes and dim must be >= 1"));
    }
    if num_classes > 2 * dim {
        return Err(Error::Domain("at most 2 * dim classes have distinct centres"));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x = Array2::<f32>::zeros((n, dim));
    let mut y = Vec::with_capacity(n);
    for i in 0..n {
        let c = i % num_classes;
        let axis = c % dim;
        let sign = if c < dim { 1.0 } else { -1.0 };
        for k in 0..dim {
            let e: f32 = StandardNormal.sample(&mut rng);
            x[[i, k]] = e + if k == axis { sign * separation } else { 0.0 };
        }
        y.push(c);
    }
    LabeledDataset::new(x, y)
}
