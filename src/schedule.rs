//! Which parameter set is updated on a given minibatch.
//!
//! The loop consults a [`PhaseSelector`] before every minibatch. Selection is a pure function
//! of `(step_in_epoch, epoch)`, so schedules can be tested without running the loop.

use serde::{Deserialize, Serialize};

/// Exactly one optimizer steps per minibatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Classifier update on `supervised + MI` loss.
    Classifier,
    /// Statistics-function update on the MI loss alone.
    Estimator,
}

pub trait PhaseSelector {
    /// `step_in_epoch` is the 0-based minibatch index within the current epoch.
    fn select(&self, step_in_epoch: usize, epoch: usize) -> Phase;
}

impl<F> PhaseSelector for F
where
    F: Fn(usize, usize) -> Phase,
{
    fn select(&self, step_in_epoch: usize, epoch: usize) -> Phase {
        self(step_in_epoch, epoch)
    }
}

/// Built-in schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// One classifier step, then `period - 1` estimator steps, repeating within each epoch.
    Interleaved { period: usize },
    /// Classifier only while `epoch <= classifier_epochs`, estimator only afterwards.
    ClassifierWarmup { classifier_epochs: usize },
    /// Always the same phase.
    Fixed { phase: Phase },
}

impl Default for Schedule {
    fn default() -> Self {
        Self::Interleaved { period: 10 }
    }
}

impl PhaseSelector for Schedule {
    fn select(&self, step_in_epoch: usize, epoch: usize) -> Phase {
        match *self {
            Schedule::Interleaved { period } => {
                if period <= 1 || step_in_epoch % period == 0 {
                    Phase::Classifier
                } else {
                    Phase::Estimator
                }
            }
            Schedule::ClassifierWarmup { classifier_epochs } => {
                if epoch <= classifier_epochs {
                    Phase::Classifier
                } else {
                    Phase::Estimator
                }
            }
            Schedule::Fixed { phase } => phase,
        }
    }
}
