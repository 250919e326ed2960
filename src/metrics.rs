//! Running metrics for the training loop (small + explicit).
//!
//! Each metric follows the same life cycle: `reset_state`, any number of `update_state`
//! calls, then `result`. An empty accumulator reports `0.0`.

use crate::{Error, Result};
use ndarray::ArrayView2;

pub trait Metric {
    fn reset_state(&mut self);
    fn result(&self) -> f32;
}

/// Fraction of rows whose argmax matches the target.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_state(&mut self, logits: &ArrayView2<f32>, targets: &[usize]) -> Result<()> {
        if logits.nrows() != targets.len() {
            return Err(Error::Shape("targets length must match logits.nrows()"));
        }
        for (row, &t) in logits.rows().into_iter().zip(targets) {
            let mut best = 0usize;
            for j in 1..row.len() {
                if row[j] > row[best] {
                    best = j;
                }
            }
            if best == t {
                self.correct += 1;
            }
        }
        self.total += targets.len();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.total
    }
}

impl Metric for Accuracy {
    fn reset_state(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn result(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.correct as f64 / self.total as f64) as f32
        }
    }
}

/// Sample-weighted mean of scalar values.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_state(&mut self, values: &[f32]) {
        self.sum += values.iter().map(|&v| v as f64).sum::<f64>();
        self.count += values.len();
    }

    /// Record `value` as if it had been observed once per sample.
    pub fn update_repeated(&mut self, value: f32, n: usize) {
        self.sum += value as f64 * n as f64;
        self.count += n;
    }
}

impl Metric for Mean {
    fn reset_state(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn result(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits =
            Array2::from_shape_vec((3, 2), vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4]).unwrap();
        let mut acc = Accuracy::new();
        acc.update_state(&logits.view(), &[0, 1, 1]).unwrap();
        assert!((acc.result() - 2.0 / 3.0).abs() < 1e-6);
        acc.reset_state();
        assert_eq!(acc.result(), 0.0);
        assert!(acc.update_state(&logits.view(), &[0]).is_err());
    }

    #[test]
    fn mean_is_sample_weighted() {
        let mut m = Mean::new();
        m.update_repeated(1.0, 3);
        m.update_state(&[5.0]);
        assert_eq!(m.result(), 2.0);
        m.reset_state();
        assert_eq!(m.result(), 0.0);
    }
}
