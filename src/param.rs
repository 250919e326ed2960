//! Trainable parameters and gradient buffers.
//!
//! Gradients are accumulated, not overwritten: every `backward` adds into
//! [`Param::grad`]. Callers clear buffers explicitly (via [`Parameterized::zero_grad`])
//! before each accumulation phase.

use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A trainable tensor plus its accumulated gradient.
///
/// Biases are stored as `1 × n` matrices so that every parameter has the same rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub value: Array2<f32>,
    /// `None` means "no gradient has flowed here since the last `zero_grad`".
    #[serde(skip)]
    pub grad: Option<Array2<f32>>,
}

impl Param {
    pub fn new(value: Array2<f32>) -> Self {
        Self { value, grad: None }
    }

    /// Add `g` into the gradient buffer.
    pub fn accumulate_grad(&mut self, g: &Array2<f32>) {
        debug_assert_eq!(g.dim(), self.value.dim());
        match self.grad.as_mut() {
            Some(buf) => *buf += g,
            None => self.grad = Some(g.clone()),
        }
    }

    /// Gradient, or zeros when nothing has been accumulated.
    pub fn grad_or_zeros(&self) -> Array2<f32> {
        self.grad
            .clone()
            .unwrap_or_else(|| Array2::zeros(self.value.dim()))
    }

    /// Sum of squared gradient entries (0 when absent).
    pub fn grad_sq_sum(&self) -> f64 {
        self.grad
            .as_ref()
            .map(|g| g.iter().map(|&v| (v as f64) * (v as f64)).sum())
            .unwrap_or(0.0)
    }
}

/// Anything that owns an ordered list of [`Param`]s.
///
/// The order returned by `params` and `params_mut` must be identical and stable:
/// optimizers and checkpoints address parameters by index.
pub trait Parameterized {
    fn params(&self) -> Vec<&Param>;
    fn params_mut(&mut self) -> Vec<&mut Param>;

    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.grad = None;
        }
    }

    /// Global L2 norm over all gradient buffers.
    fn grad_norm(&self) -> f64 {
        self.params()
            .iter()
            .map(|p| p.grad_sq_sum())
            .sum::<f64>()
            .sqrt()
    }

    /// Copy of all parameter values, in `params` order.
    fn snapshot(&self) -> Vec<Array2<f32>> {
        self.params().iter().map(|p| p.value.clone()).collect()
    }

    /// Overwrite parameter values from a snapshot. Shapes must match exactly.
    fn load_snapshot(&mut self, values: &[Array2<f32>]) -> Result<()> {
        let mut params = self.params_mut();
        if params.len() != values.len() {
            return Err(Error::Config(format!(
                "parameter count mismatch: model has {}, snapshot has {}",
                params.len(),
                values.len()
            )));
        }
        for (i, (p, v)) in params.iter_mut().zip(values).enumerate() {
            if p.value.dim() != v.dim() {
                return Err(Error::Config(format!(
                    "parameter {i} shape mismatch: model {:?}, snapshot {:?}",
                    p.value.dim(),
                    v.dim()
                )));
            }
            p.value.assign(v);
            p.grad = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: Param,
        b: Param,
    }

    impl Parameterized for Pair {
        fn params(&self) -> Vec<&Param> {
            vec![&self.a, &self.b]
        }
        fn params_mut(&mut self) -> Vec<&mut Param> {
            vec![&mut self.a, &mut self.b]
        }
    }

    #[test]
    fn gradients_accumulate_until_cleared() {
        let mut m = Pair {
            a: Param::new(Array2::zeros((1, 2))),
            b: Param::new(Array2::zeros((1, 1))),
        };
        let g = Array2::from_shape_vec((1, 2), vec![3.0, 4.0]).unwrap();
        m.a.accumulate_grad(&g);
        m.a.accumulate_grad(&g);
        assert_eq!(m.a.grad.as_ref().unwrap()[[0, 1]], 8.0);
        // b never received a gradient.
        assert!((m.grad_norm() - 10.0).abs() < 1e-9);

        m.zero_grad();
        assert!(m.a.grad.is_none());
        assert_eq!(m.grad_norm(), 0.0);
    }

    #[test]
    fn load_snapshot_rejects_shape_mismatch() {
        let mut m = Pair {
            a: Param::new(Array2::zeros((1, 2))),
            b: Param::new(Array2::zeros((1, 1))),
        };
        let bad = vec![Array2::zeros((2, 2)), Array2::zeros((1, 1))];
        assert!(matches!(m.load_snapshot(&bad), Err(Error::Config(_))));

        let good = vec![Array2::ones((1, 2)), Array2::ones((1, 1))];
        m.load_snapshot(&good).unwrap();
        assert_eq!(m.snapshot(), good);
    }
}
