//! Adaptive gradient clipping between two losses that share a parameter set.
//!
//! Let `g_main` and `g_sub` be the gradients of the two losses. After
//! [`adaptive_clipping`], the parameter gradients hold
//!
//! ```text
//! g_main + scale * g_sub,   scale = min(|g_sub|, |g_main|) / |g_sub|
//! ```
//!
//! so the sub-loss never dominates the combined direction in norm. `scale = 1` when
//! `|g_sub| = 0`. The optimizer step is left to the caller.

use crate::param::Parameterized;
use crate::Result;
use ndarray::Array2;

/// Something that can accumulate its gradient into `M`'s parameter buffers.
///
/// Implemented for any `FnMut(&mut M) -> Result<()>`. May be called more than once, so
/// implementations must not consume the state they backpropagate from.
pub trait Backward<M: ?Sized> {
    fn backward(&mut self, model: &mut M) -> Result<()>;
}

impl<M: ?Sized, F> Backward<M> for F
where
    F: FnMut(&mut M) -> Result<()>,
{
    fn backward(&mut self, model: &mut M) -> Result<()> {
        self(model)
    }
}

/// Norms observed by one [`adaptive_clipping`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipReport {
    pub norm_main: f64,
    pub norm_sub: f64,
    pub scale: f64,
}

/// Combine `loss_main` and a norm-capped `loss_sub` into `model`'s gradient buffers.
///
/// Order of effects: clear grads, backprop `loss_sub`, snapshot its gradients (zeros for
/// parameters that got none), clear grads, backprop `loss_main`, then add the rescaled
/// snapshot on top.
pub fn adaptive_clipping<M, A, B>(
    loss_main: &mut A,
    loss_sub: &mut B,
    model: &mut M,
) -> Result<ClipReport>
where
    M: Parameterized + ?Sized,
    A: Backward<M> + ?Sized,
    B: Backward<M> + ?Sized,
{
    model.zero_grad();
    loss_sub.backward(model)?;
    let grads_sub: Vec<Array2<f32>> = model.params().iter().map(|p| p.grad_or_zeros()).collect();
    let norm_sub = model.grad_norm();

    model.zero_grad();
    loss_main.backward(model)?;
    let norm_main = model.grad_norm();

    let scale = if norm_sub == 0.0 {
        1.0
    } else {
        norm_sub.min(norm_main) / norm_sub
    };

    for (p, g_sub) in model.params_mut().into_iter().zip(grads_sub) {
        let scaled = g_sub * scale as f32;
        p.accumulate_grad(&scaled);
    }

    tracing::trace!(norm_main, norm_sub, scale, "adaptive clipping");
    Ok(ClipReport {
        norm_main,
        norm_sub,
        scale,
    })
}
