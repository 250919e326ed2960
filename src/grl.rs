//! Gradient reversal: identity on the forward pass, `-beta * grad` on the backward pass.
//!
//! Placed between the bottleneck `z` and the MI estimator, it turns "maximize the MI
//! estimate" (what the estimator wants) into "minimize it" for the classifier, scaled
//! by `beta`.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientReversal {
    beta: f32,
}

impl GradientReversal {
    /// `beta` must be finite and non-negative.
    pub fn new(beta: f32) -> Result<Self> {
        if !beta.is_finite() || beta < 0.0 {
            return Err(Error::Domain("gradient reversal beta must be finite and >= 0"));
        }
        Ok(Self { beta })
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.to_owned()
    }

    pub fn backward(&self, grad: &ArrayView2<f32>) -> Array2<f32> {
        grad.mapv(|g| -self.beta * g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_negative_beta() {
        assert!(GradientReversal::new(-0.1).is_err());
        assert!(GradientReversal::new(f32::NAN).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_forward_is_identity_and_backward_negates(
            beta in 0.0f32..10.0,
            vals in prop::collection::vec(-100.0f32..100.0, 6),
        ) {
            let grl = GradientReversal::new(beta).unwrap();
            let x = Array2::from_shape_vec((2, 3), vals).unwrap();
            prop_assert_eq!(grl.forward(&x.view()), x.clone());
            let g = grl.backward(&x.view());
            for (a, b) in g.iter().zip(x.iter()) {
                prop_assert_eq!(*a, -beta * *b);
            }
        }
    }
}
