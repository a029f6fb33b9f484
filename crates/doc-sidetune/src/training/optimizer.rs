//! Optimizers for candle `Var` tensors.
//!
//! - [`Adam`]: Adam with bias correction and optional decoupled weight decay
//! - [`SgdMomentum`]: SGD with heavy-ball momentum
//! - [`LrSchedule`]: per-epoch learning-rate factor
//!
//! Both optimizers compute gradients themselves from the loss, optionally
//! clip the global gradient norm, and write new values with `Var::set`.
//! Parameters without a gradient (frozen branches, batch-norm running
//! statistics) are skipped.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// Optimizer choice and hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        #[serde(default = "default_adam_lr")]
        lr: f64,
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
        /// Decoupled weight decay, off by default.
        #[serde(default)]
        weight_decay: f64,
    },
    Sgd {
        #[serde(default = "default_sgd_lr")]
        lr: f64,
        #[serde(default = "default_momentum")]
        momentum: f64,
    },
}

fn default_adam_lr() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-8
}

fn default_sgd_lr() -> f64 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::adam()
    }
}

impl OptimizerConfig {
    /// Adam with lr 1e-4.
    pub fn adam() -> Self {
        Self::Adam {
            lr: default_adam_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            weight_decay: 0.0,
        }
    }

    /// SGD with lr 0.1 and momentum 0.9.
    pub fn sgd() -> Self {
        Self::Sgd {
            lr: default_sgd_lr(),
            momentum: default_momentum(),
        }
    }

    /// Parse `"adam"` or `"sgd"` into the default hyperparameters for it.
    pub fn from_name(name: &str) -> SideTuneResult<Self> {
        match name.to_lowercase().as_str() {
            "adam" => Ok(Self::adam()),
            "sgd" => Ok(Self::sgd()),
            other => Err(SideTuneError::config(format!(
                "unknown optimizer '{}', expected 'adam' or 'sgd'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Adam { .. } => "adam",
            Self::Sgd { .. } => "sgd",
        }
    }

    pub fn base_lr(&self) -> f64 {
        match self {
            Self::Adam { lr, .. } | Self::Sgd { lr, .. } => *lr,
        }
    }

    /// Schedule paired with this optimizer: Adam keeps its rate, SGD decays
    /// with [`LrSchedule::SqrtDecay`].
    pub fn schedule(&self, num_epochs: usize) -> LrSchedule {
        match self {
            Self::Adam { .. } => LrSchedule::Constant,
            Self::Sgd { .. } => LrSchedule::SqrtDecay { num_epochs },
        }
    }

    pub fn validate(&self) -> SideTuneResult<()> {
        let lr = self.base_lr();
        if !(lr > 0.0) || !lr.is_finite() {
            return Err(SideTuneError::config(format!(
                "learning rate must be positive, got {}",
                lr
            )));
        }
        match self {
            Self::Adam { beta1, beta2, epsilon, weight_decay, .. } => {
                if !(0.0..1.0).contains(beta1) || !(0.0..1.0).contains(beta2) {
                    return Err(SideTuneError::config("Adam betas must be in [0, 1)"));
                }
                if !(*epsilon > 0.0) || *weight_decay < 0.0 {
                    return Err(SideTuneError::config(
                        "Adam epsilon must be > 0 and weight_decay >= 0",
                    ));
                }
            }
            Self::Sgd { momentum, .. } => {
                if !(0.0..1.0).contains(momentum) {
                    return Err(SideTuneError::config("SGD momentum must be in [0, 1)"));
                }
            }
        }
        Ok(())
    }

    /// Build the optimizer over `vars`.
    pub fn build(&self, vars: Vec<Var>, max_grad_norm: Option<f64>) -> SideTuneResult<Box<dyn Optimizer>> {
        self.validate()?;
        let optimizer: Box<dyn Optimizer> = match self {
            Self::Adam { lr, beta1, beta2, epsilon, weight_decay } => Box::new(Adam::new(
                vars,
                AdamConfig {
                    lr: *lr,
                    beta1: *beta1,
                    beta2: *beta2,
                    epsilon: *epsilon,
                    weight_decay: *weight_decay,
                    max_grad_norm,
                },
            )?),
            Self::Sgd { lr, momentum } => {
                Box::new(SgdMomentum::new(vars, *lr, *momentum, max_grad_norm)?)
            }
        };
        Ok(optimizer)
    }
}

/// Per-epoch learning-rate factor, applied to the base rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    Constant,
    /// `0.1 * (1 - epoch / num_epochs)^0.5` for 0-based `epoch`.
    SqrtDecay { num_epochs: usize },
}

impl LrSchedule {
    /// Factor for the 0-based epoch index.
    pub fn factor(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant => 1.0,
            Self::SqrtDecay { num_epochs } => {
                let progress = epoch as f64 / (*num_epochs).max(1) as f64;
                0.1 * (1.0 - progress).max(0.0).sqrt()
            }
        }
    }

    pub fn lr(&self, base_lr: f64, epoch: usize) -> f64 {
        base_lr * self.factor(epoch)
    }
}

/// A gradient-based optimizer over a fixed set of variables.
pub trait Optimizer {
    /// Backpropagate `loss` and update every registered parameter.
    fn step(&mut self, loss: &Tensor) -> SideTuneResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn num_params(&self) -> usize;

    fn global_step(&self) -> usize;
}

/// Scale factor that brings the global gradient norm down to `max_norm`.
fn clip_scale(vars: &[&Var], grads: &GradStore, max_norm: Option<f64>) -> SideTuneResult<f64> {
    let max_norm = match max_norm {
        Some(n) => n,
        None => return Ok(1.0),
    };
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq_sum: f32 = grad
                .sqr()
                .and_then(|g| g.sum_all())
                .and_then(|g| g.to_scalar())
                .map_err(map_candle("gradient norm"))?;
            total_sq += sq_sum as f64;
        }
    }
    let total_norm = total_sq.sqrt();
    if total_norm > max_norm {
        Ok(max_norm / (total_norm + 1e-6))
    } else {
        Ok(1.0)
    }
}

fn zeros_like_var(var: &Var) -> SideTuneResult<Tensor> {
    var.as_tensor()
        .zeros_like()
        .map_err(map_candle("optimizer state init"))
}

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
}

struct AdamParam {
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Adam with decoupled weight decay (AdamW when `weight_decay > 0`).
pub struct Adam {
    config: AdamConfig,
    params: Vec<AdamParam>,
    step: usize,
}

impl Adam {
    pub fn new(vars: Vec<Var>, config: AdamConfig) -> SideTuneResult<Self> {
        let params = vars
            .into_iter()
            .map(|var| {
                Ok(AdamParam {
                    m: zeros_like_var(&var)?,
                    v: zeros_like_var(&var)?,
                    var,
                })
            })
            .collect::<SideTuneResult<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, loss: &Tensor) -> SideTuneResult<()> {
        self.step += 1;
        let t = self.step as i32;
        let grads = loss.backward().map_err(map_candle("Adam backward"))?;

        let vars: Vec<&Var> = self.params.iter().map(|p| &p.var).collect();
        let scale = clip_scale(&vars, &grads, self.config.max_grad_norm)?;

        let AdamConfig {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            ..
        } = self.config;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let ctx = map_candle("Adam update");

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let grad = if (scale - 1.0).abs() > 1e-12 {
                grad.affine(scale, 0.0).map_err(&ctx)?
            } else {
                grad.clone()
            };

            // m = b1 * m + (1 - b1) * g
            param.m = param
                .m
                .affine(beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - beta1, 0.0)?))
                .map_err(&ctx)?
                .detach();
            // v = b2 * v + (1 - b2) * g^2
            param.v = param
                .v
                .affine(beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?))
                .map_err(&ctx)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(&ctx)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, epsilon))
                .map_err(&ctx)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(-lr, 0.0))
                .map_err(&ctx)?;

            let current = param.var.as_tensor();
            let mut new_val = current.add(&update).map_err(&ctx)?;
            if weight_decay > 0.0 {
                let decay = current.affine(-lr * weight_decay, 0.0).map_err(&ctx)?;
                new_val = new_val.add(&decay).map_err(&ctx)?;
            }
            param.var.set(&new_val.detach()).map_err(&ctx)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn global_step(&self) -> usize {
        self.step
    }
}

struct SgdParam {
    var: Var,
    velocity: Option<Tensor>,
}

/// SGD with momentum: `buf = momentum * buf + g; p -= lr * buf`, where the
/// first step initializes `buf = g`.
pub struct SgdMomentum {
    lr: f64,
    momentum: f64,
    max_grad_norm: Option<f64>,
    params: Vec<SgdParam>,
    step: usize,
}

impl SgdMomentum {
    pub fn new(
        vars: Vec<Var>,
        lr: f64,
        momentum: f64,
        max_grad_norm: Option<f64>,
    ) -> SideTuneResult<Self> {
        Ok(Self {
            lr,
            momentum,
            max_grad_norm,
            params: vars
                .into_iter()
                .map(|var| SgdParam {
                    var,
                    velocity: None,
                })
                .collect(),
            step: 0,
        })
    }
}

impl Optimizer for SgdMomentum {
    fn step(&mut self, loss: &Tensor) -> SideTuneResult<()> {
        self.step += 1;
        let grads = loss.backward().map_err(map_candle("SGD backward"))?;

        let vars: Vec<&Var> = self.params.iter().map(|p| &p.var).collect();
        let scale = clip_scale(&vars, &grads, self.max_grad_norm)?;
        let ctx = map_candle("SGD update");

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g.affine(scale, 0.0).map_err(&ctx)?,
                None => continue,
            };
            let buf = match &param.velocity {
                Some(prev) if self.momentum > 0.0 => prev
                    .affine(self.momentum, 0.0)
                    .and_then(|p| p.add(&grad))
                    .map_err(&ctx)?,
                _ => grad,
            }
            .detach();

            let new_val = param
                .var
                .as_tensor()
                .sub(&buf.affine(self.lr, 0.0).map_err(&ctx)?)
                .map_err(&ctx)?
                .detach();
            param.var.set(&new_val).map_err(&ctx)?;
            param.velocity = Some(buf);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn global_step(&self) -> usize {
        self.step
    }
}
