//! Supervised loss for the classifier head.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Mean softmax cross-entropy over a batch, plus `dL/dlogits`.
///
/// Uses the max-shifted log-sum-exp, so large logits do not overflow.
pub fn cross_entropy(logits: &ArrayView2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)> {
    let (n, k) = logits.dim();
    if n == 0 || k == 0 {
        return Err(Error::Domain("logits must be non-empty"));
    }
    if targets.len() != n {
        return Err(Error::Shape("targets length must match logits.nrows()"));
    }
    if targets.iter().any(|&t| t >= k) {
        return Err(Error::Domain("target class out of range"));
    }

    let mut grad = Array2::<f32>::zeros((n, k));
    let mut total = 0.0f64;
    for (i, row) in logits.rows().into_iter().enumerate() {
        let m = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let sum_exp: f64 = row.iter().map(|&v| ((v - m) as f64).exp()).sum();
        let lse = m as f64 + sum_exp.ln();
        total += lse - row[targets[i]] as f64;
        for j in 0..k {
            let p = ((row[j] as f64 - lse).exp()) as f32;
            grad[[i, j]] = p / n as f32;
        }
        grad[[i, targets[i]]] -= 1.0 / n as f32;
    }

    let loss = (total / n as f64) as f32;
    if !loss.is_finite() {
        return Err(Error::NonFinite("cross-entropy loss"));
    }
    Ok((loss, grad))
}
