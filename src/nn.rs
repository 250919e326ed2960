//! Minimal dense layers with explicit backward passes.
//!
//! Weights follow the `[d_input, d_output]` layout (same as burn's `Linear`), so a forward
//! pass is `y = x · W + b` on row-major batches.

use crate::param::Param;
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
}

impl Linear {
    /// Uniform init in `[-1/sqrt(d_in), 1/sqrt(d_in)]` for both weight and bias.
    pub fn new(d_in: usize, d_out: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (d_in.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((d_in, d_out), |_| rng.random_range(-bound..bound));
        let bias = Array2::from_shape_fn((1, d_out), |_| rng.random_range(-bound..bound));
        Self {
            weight: Param::new(weight),
            bias: Param::new(bias),
        }
    }

    pub fn d_in(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn d_out(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.ncols(), self.d_in());
        x.dot(&self.weight.value) + &self.bias.value
    }

    /// Accumulates `dW = xᵀ·dy`, `db = Σ_rows dy`; returns `dx = dy·Wᵀ`.
    pub fn backward(&mut self, x: &ArrayView2<f32>, dy: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.nrows(), dy.nrows());
        let dw = x.t().dot(dy);
        let db = dy.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.weight.accumulate_grad(&dw);
        self.bias.accumulate_grad(&db);
        dy.dot(&self.weight.value.t())
    }

    pub fn params(&self) -> [&Param; 2] {
        [&self.weight, &self.bias]
    }

    pub fn params_mut(&mut self) -> [&mut Param; 2] {
        [&mut self.weight, &mut self.bias]
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Gradient of ReLU given its pre-activation input.
pub fn relu_backward(pre: &Array2<f32>, dy: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = dy.to_owned();
    out.zip_mut_with(pre, |d, &p| {
        if p <= 0.0 {
            *d = 0.0;
        }
    });
    out
}
