//! First-order optimizers over [`Parameterized`] models.
//!
//! An optimizer never owns parameters: it reads `Param::grad` and updates `Param::value`
//! for whichever model it is handed. Two optimizers over disjoint models therefore never
//! share state.
//!
//! Update rules follow the usual framework conventions:
//! - `sgd`: `buf = momentum * buf + g` (first step `buf = g`), `w -= lr * buf`
//! - `rmsprop`: `sq = 0.99 sq + 0.01 g²`, `w -= lr * g / (sqrt(sq) + 1e-8)` (with an optional
//!   momentum buffer over the normalized step)
//! - `adam`: betas `(0.9, 0.999)`, eps `1e-8`, bias-corrected
//!
//! Weight decay is L2 (`g += weight_decay * w`). Parameters without a gradient are skipped.

use crate::param::Parameterized;
use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const RMSPROP_ALPHA: f32 = 0.99;
const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    RmsProp,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "rmsprop" => Ok(Self::RmsProp),
            "adam" => Ok(Self::Adam),
            other => Err(Error::Config(format!("unknown optimizer {other:?}"))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sgd => "sgd",
            Self::RmsProp => "rmsprop",
            Self::Adam => "adam",
        })
    }
}

impl OptimizerKind {
    /// Whether `momentum` means anything for this algorithm.
    pub fn uses_momentum(self) -> bool {
        matches!(self, Self::Sgd | Self::RmsProp)
    }
}

/// Options applied to a parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimOptions {
    pub lr: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

impl Default for OptimOptions {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.0,
            momentum: 0.0,
        }
    }
}

/// Per-group overrides of the global [`OptimOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionOverrides {
    pub lr: Option<f32>,
    pub weight_decay: Option<f32>,
    pub momentum: Option<f32>,
}

impl OptionOverrides {
    fn apply(&self, global: &OptimOptions) -> OptimOptions {
        OptimOptions {
            lr: self.lr.unwrap_or(global.lr),
            weight_decay: self.weight_decay.unwrap_or(global.weight_decay),
            momentum: self.momentum.unwrap_or(global.momentum),
        }
    }
}

/// Which parameters (by index in `Parameterized::params`) a group covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamSelector {
    All,
    Indices(Vec<usize>),
}

impl ParamSelector {
    fn contains(&self, i: usize) -> bool {
        match self {
            Self::All => true,
            Self::Indices(ix) => ix.contains(&i),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: ParamSelector,
    pub overrides: OptionOverrides,
}

impl ParamGroup {
    pub fn all() -> Self {
        Self {
            params: ParamSelector::All,
            overrides: OptionOverrides::default(),
        }
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.overrides.lr = Some(lr);
        self
    }
}

/// Per-parameter running statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub step: u64,
    /// Momentum buffer (sgd/rmsprop) or first moment (adam).
    pub buf: Option<Array2<f32>>,
    /// Square average (rmsprop) or second moment (adam).
    pub sq: Option<Array2<f32>>,
}

/// Serializable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub slots: Vec<SlotState>,
}

#[derive(Debug, Clone)]
struct ResolvedGroup {
    params: ParamSelector,
    options: OptimOptions,
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    groups: Vec<ResolvedGroup>,
    slots: Vec<SlotState>,
}

/// Build an optimizer from an algorithm identifier, parameter groups and global options.
///
/// Each parameter is governed by the first group that selects it; unselected parameters
/// are never updated.
pub fn build_optimizer(name: &str, groups: Vec<ParamGroup>, global: OptimOptions) -> Result<Optimizer> {
    let kind: OptimizerKind = name.parse()?;
    if groups.is_empty() {
        return Err(Error::Config("optimizer needs at least one parameter group".into()));
    }
    let groups = groups
        .into_iter()
        .map(|g| {
            let options = g.overrides.apply(&global);
            if !(options.lr > 0.0) || !options.lr.is_finite() {
                return Err(Error::Config(format!("invalid learning rate {}", options.lr)));
            }
            if options.weight_decay < 0.0 || !(0.0..1.0).contains(&options.momentum) {
                return Err(Error::Config(
                    "weight_decay must be >= 0 and momentum in [0, 1)".into(),
                ));
            }
            Ok(ResolvedGroup {
                params: g.params,
                options,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Optimizer {
        kind,
        groups,
        slots: Vec::new(),
    })
}

impl Optimizer {
    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Effective options for parameter `i`, if any group covers it.
    pub fn options_for(&self, i: usize) -> Option<OptimOptions> {
        self.groups
            .iter()
            .find(|g| g.params.contains(i))
            .map(|g| g.options)
    }

    pub fn zero_grad<M: Parameterized + ?Sized>(&self, model: &mut M) {
        model.zero_grad();
    }

    /// Apply one update to every parameter of `model` that has a gradient.
    ///
    /// A non-finite gradient on any selected parameter fails the whole step before anything
    /// is updated.
    pub fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        let params = model.params_mut();
        if self.slots.len() < params.len() {
            self.slots.resize_with(params.len(), SlotState::default);
        }
        let poisoned = params.iter().enumerate().any(|(i, p)| {
            self.options_for(i).is_some()
                && p.grad.as_ref().is_some_and(|g| g.iter().any(|v| !v.is_finite()))
        });
        if poisoned {
            return Err(Error::NonFinite("gradient"));
        }

        for (i, p) in params.into_iter().enumerate() {
            let Some(opts) = self.options_for(i) else {
                continue;
            };
            let Some(grad) = p.grad.as_ref() else {
                continue;
            };

            let mut g = grad.clone();
            if opts.weight_decay != 0.0 {
                g.scaled_add(opts.weight_decay, &p.value);
            }

            let slot = &mut self.slots[i];
            slot.step += 1;

            match self.kind {
                OptimizerKind::Sgd => {
                    if opts.momentum != 0.0 {
                        let buf = match slot.buf.take() {
                            None => g,
                            Some(mut b) => {
                                b *= opts.momentum;
                                b += &g;
                                b
                            }
                        };
                        p.value.scaled_add(-opts.lr, &buf);
                        slot.buf = Some(buf);
                    } else {
                        p.value.scaled_add(-opts.lr, &g);
                    }
                }
                OptimizerKind::RmsProp => {
                    let mut sq = slot.sq.take().unwrap_or_else(|| Array2::zeros(g.dim()));
                    sq.zip_mut_with(&g, |s, &gi| {
                        *s = RMSPROP_ALPHA * *s + (1.0 - RMSPROP_ALPHA) * gi * gi
                    });
                    let mut update = g;
                    update.zip_mut_with(&sq, |u, &s| *u /= s.sqrt() + EPS);
                    if opts.momentum != 0.0 {
                        let mut buf = slot.buf.take().unwrap_or_else(|| Array2::zeros(update.dim()));
                        buf *= opts.momentum;
                        buf += &update;
                        p.value.scaled_add(-opts.lr, &buf);
                        slot.buf = Some(buf);
                    } else {
                        p.value.scaled_add(-opts.lr, &update);
                    }
                    slot.sq = Some(sq);
                }
                OptimizerKind::Adam => {
                    let mut m = slot.buf.take().unwrap_or_else(|| Array2::zeros(g.dim()));
                    let mut v = slot.sq.take().unwrap_or_else(|| Array2::zeros(g.dim()));
                    m.zip_mut_with(&g, |mi, &gi| *mi = ADAM_BETA1 * *mi + (1.0 - ADAM_BETA1) * gi);
                    v.zip_mut_with(&g, |vi, &gi| {
                        *vi = ADAM_BETA2 * *vi + (1.0 - ADAM_BETA2) * gi * gi
                    });
                    let t = slot.step as i32;
                    let bc1 = 1.0 - ADAM_BETA1.powi(t);
                    let bc2 = 1.0 - ADAM_BETA2.powi(t);
                    let lr = opts.lr;
                    ndarray::Zip::from(&mut p.value)
                        .and(&m)
                        .and(&v)
                        .for_each(|w, &mi, &vi| {
                            let m_hat = mi / bc1;
                            let v_hat = vi / bc2;
                            *w -= lr * m_hat / (v_hat.sqrt() + EPS);
                        });
                    slot.buf = Some(m);
                    slot.sq = Some(v);
                }
            }
        }
        Ok(())
    }

    pub fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            slots: self.slots.clone(),
        }
    }

    pub fn load_state_dict(&mut self, state: OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(Error::Config(format!(
                "optimizer state is for {}, optimizer is {}",
                state.kind, self.kind
            )));
        }
        self.slots = state.slots;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Param;

    struct Quad {
        w: Param,
        frozen: Param,
    }

    impl Parameterized for Quad {
        fn params(&self) -> Vec<&Param> {
            vec![&self.w, &self.frozen]
        }
        fn params_mut(&mut self) -> Vec<&mut Param> {
            vec![&mut self.w, &mut self.frozen]
        }
    }

    impl Quad {
        fn new() -> Self {
            Self {
                w: Param::new(Array2::from_elem((1, 2), 3.0)),
                frozen: Param::new(Array2::from_elem((1, 1), 1.0)),
            }
        }

        /// Gradient of 0.5 * |w|² (and of 0.5 * frozen²).
        fn backward(&mut self) {
            let gw = self.w.value.clone();
            let gf = self.frozen.value.clone();
            self.w.accumulate_grad(&gw);
            self.frozen.accumulate_grad(&gf);
        }
    }

    fn run(name: &str, momentum: f32, steps: usize) -> Quad {
        let mut q = Quad::new();
        let mut opt = build_optimizer(
            name,
            vec![ParamGroup {
                params: ParamSelector::Indices(vec![0]),
                overrides: OptionOverrides::default(),
            }],
            OptimOptions {
                lr: 0.05,
                weight_decay: 0.0,
                momentum,
            },
        )
        .unwrap();
        for _ in 0..steps {
            opt.zero_grad(&mut q);
            q.backward();
            opt.step(&mut q).unwrap();
        }
        q
    }

    #[test]
    fn all_algorithms_descend_a_quadratic() {
        for (name, momentum) in [("sgd", 0.0), ("sgd", 0.9), ("RMSProp", 0.0), ("adam", 0.0)] {
            let q = run(name, momentum, 200);
            let norm = q.w.value.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            assert!(norm < 1.0, "{name} (momentum {momentum}) did not descend: {norm}");
            // Parameter 1 is outside every group.
            assert_eq!(q.frozen.value[[0, 0]], 1.0, "{name} touched an unselected parameter");
        }
    }

    #[test]
    fn non_finite_gradient_aborts_before_any_update() {
        let mut q = Quad::new();
        let mut opt = build_optimizer(
            "adam",
            vec![ParamGroup::all()],
            OptimOptions {
                lr: 0.05,
                ..Default::default()
            },
        )
        .unwrap();
        q.backward();
        q.frozen.grad = Some(Array2::from_elem((1, 1), f32::NAN));
        let err = opt.step(&mut q).err().unwrap();
        assert!(matches!(err, Error::NonFinite(_)));
        assert_eq!(q.w.value, Array2::from_elem((1, 2), 3.0));
        assert!(opt.state_dict().slots.iter().all(|s| s.step == 0));
    }

    #[test]
    fn plain_sgd_step_is_exact() {
        let q = run("sgd", 0.0, 1);
        // w = 3 - 0.05 * 3
        assert_eq!(q.w.value[[0, 0]], 3.0 - 0.05 * 3.0);
    }

    #[test]
    fn group_overrides_take_precedence() {
        let opt = build_optimizer(
            "sgd",
            vec![
                ParamGroup {
                    params: ParamSelector::Indices(vec![1]),
                    overrides: OptionOverrides {
                        lr: Some(1e-5),
                        ..Default::default()
                    },
                },
                ParamGroup::all(),
            ],
            OptimOptions {
                lr: 0.05,
                weight_decay: 1e-4,
                momentum: 0.9,
            },
        )
        .unwrap();
        assert_eq!(opt.options_for(1).unwrap().lr, 1e-5);
        assert_eq!(opt.options_for(1).unwrap().momentum, 0.9);
        assert_eq!(opt.options_for(0).unwrap().lr, 0.05);
    }

    #[test]
    fn unknown_algorithm_and_bad_options_are_rejected() {
        assert!(build_optimizer("lbfgs", vec![ParamGroup::all()], OptimOptions::default()).is_err());
        assert!(build_optimizer("sgd", vec![], OptimOptions::default()).is_err());
        assert!(build_optimizer("sgd", vec![ParamGroup::all().with_lr(-1.0)], OptimOptions::default()).is_err());
    }

    #[test]
    fn state_dict_round_trip_resumes_identically() {
        let mut q1 = Quad::new();
        let mut q2 = Quad::new();
        let mk = || build_optimizer("adam", vec![ParamGroup::all()], OptimOptions::default()).unwrap();
        let mut o1 = mk();
        for _ in 0..3 {
            o1.zero_grad(&mut q1);
            q1.backward();
            o1.step(&mut q1).unwrap();
        }
        let json = serde_json::to_string(&o1.state_dict()).unwrap();
        let mut o2 = mk();
        o2.load_state_dict(serde_json::from_str(&json).unwrap()).unwrap();
        q2.load_snapshot(&q1.snapshot()).unwrap();

        for (q, o) in [(&mut q1, &mut o1), (&mut q2, &mut o2)] {
            o.zero_grad(q);
            q.backward();
            o.step(q).unwrap();
        }
        assert_eq!(q1.w.value, q2.w.value);

        let mut sgd = build_optimizer("sgd", vec![ParamGroup::all()], OptimOptions::default()).unwrap();
        assert!(sgd.load_state_dict(o1.state_dict()).is_err());
    }

    #[test]
    fn non_finite_gradient_propagates() {
        let mut q = Quad::new();
        q.w.accumulate_grad(&Array2::from_elem((1, 2), f32::NAN));
        let mut opt = build_optimizer("sgd", vec![ParamGroup::all()], OptimOptions::default()).unwrap();
        assert!(matches!(opt.step(&mut q), Err(Error::NonFinite(_))));
    }
}
