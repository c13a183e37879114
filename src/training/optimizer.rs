/// Momentum SGD and Adam optimizers
///
/// Weight decay is an L2 term added to the gradient, and the SGD momentum
/// buffer starts from the first gradient.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;
use std::collections::HashSet;
use std::str::FromStr;

use crate::TrainConfig;

/// Optimizer family selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = crate::DaError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(crate::DaError::Configuration(format!(
                "optimizer not implemented: {}. Must be 'sgd' or 'adam'",
                other
            ))),
        }
    }
}

/// Momentum SGD configuration
#[derive(Debug, Clone)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

/// SGD with momentum and L2 weight decay
pub struct MomentumSgd {
    vars: Vec<Var>,
    buffers: Vec<Option<Tensor>>,
    config: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, config: ParamsSgd) -> Result<Self> {
        let buffers = vec![None; vars.len()];
        Ok(Self { vars, buffers, config })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (var, buffer) in self.vars.iter().zip(self.buffers.iter_mut()) {
            let grad = match grads.get(var) {
                Some(grad) => grad,
                None => continue,
            };

            // d_p = grad + weight_decay * param
            let mut d_p = if self.config.weight_decay > 0.0 {
                (grad + (var.as_tensor() * self.config.weight_decay)?)?
            } else {
                grad.clone()
            };

            // buf = momentum * buf + d_p
            if self.config.momentum > 0.0 {
                let next = match buffer.take() {
                    Some(buf) => ((buf * self.config.momentum)? + &d_p)?,
                    None => d_p.clone(),
                };
                *buffer = Some(next.clone());
                d_p = next;
            }

            var.set(&var.as_tensor().sub(&(d_p * self.config.lr)?)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Adam configuration
#[derive(Debug, Clone)]
pub struct ParamsAdam {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment estimates of one parameter
#[derive(Debug, Clone)]
struct ParamState {
    /// First moment estimate (exponential moving average of gradients)
    m: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    v: Tensor,
}

/// Adam with coupled (L2) weight decay
pub struct Adam {
    vars: Vec<Var>,
    states: Vec<ParamState>,
    config: ParamsAdam,
    step_t: usize,
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, config: ParamsAdam) -> Result<Self> {
        let states = vars
            .iter()
            .map(|var| {
                Ok(ParamState {
                    m: var.zeros_like()?,
                    v: var.zeros_like()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            vars,
            states,
            config,
            step_t: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let c = &self.config;
        let bias1 = 1.0 - c.beta1.powi(self.step_t as i32);
        let bias2 = 1.0 - c.beta2.powi(self.step_t as i32);

        for (var, state) in self.vars.iter().zip(self.states.iter_mut()) {
            let grad = match grads.get(var) {
                Some(grad) => grad,
                None => continue,
            };

            let grad = if c.weight_decay > 0.0 {
                (grad + (var.as_tensor() * c.weight_decay)?)?
            } else {
                grad.clone()
            };

            // m = beta1 * m + (1 - beta1) * grad
            state.m = ((&state.m * c.beta1)? + (&grad * (1.0 - c.beta1))?)?;
            // v = beta2 * v + (1 - beta2) * grad^2
            state.v = ((&state.v * c.beta2)? + (grad.sqr()? * (1.0 - c.beta2))?)?;

            let m_hat = (&state.m / bias1)?;
            let v_hat = (&state.v / bias2)?;

            // param = param - lr * m_hat / (sqrt(v_hat) + eps)
            let update = ((m_hat / (v_hat.sqrt()? + c.eps)?)? * c.lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

enum Inner {
    Sgd(MomentumSgd),
    Adam(Adam),
}

/// Configured optimizer over one parameter group, counting its steps
pub struct DomainOptimizer {
    inner: Inner,
    num_vars: usize,
    steps: usize,
}

impl DomainOptimizer {
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.steps += 1;
        match &mut self.inner {
            Inner::Sgd(opt) => opt.step(grads),
            Inner::Adam(opt) => opt.step(grads),
        }
    }

    /// Backward pass of `loss` followed by one step over this group only
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::Sgd(opt) => opt.learning_rate(),
            Inner::Adam(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::Sgd(opt) => opt.set_learning_rate(lr),
            Inner::Adam(opt) => opt.set_learning_rate(lr),
        }
    }

    /// Number of `step` calls so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }
}

/// Build the configured optimizer over the union of `vars`
///
/// Vars pooled from several networks are de-duplicated, so every parameter
/// is updated at most once per step.
pub fn build_optimizer(vars: Vec<Var>, config: &TrainConfig) -> crate::Result<DomainOptimizer> {
    let kind = config.optimizer_kind()?;

    let mut seen = HashSet::new();
    let vars: Vec<Var> = vars
        .into_iter()
        .filter(|var| seen.insert(var.as_tensor().id()))
        .collect();
    let num_vars = vars.len();

    let inner = match kind {
        OptimizerKind::Sgd => Inner::Sgd(MomentumSgd::new(
            vars,
            ParamsSgd {
                lr: config.lr,
                momentum: config.momentum,
                weight_decay: config.weight_decay,
            },
        )?),
        OptimizerKind::Adam => Inner::Adam(Adam::new(
            vars,
            ParamsAdam {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?),
    };

    log::debug!("Built {:?} optimizer over {} parameter tensors", kind, num_vars);

    Ok(DomainOptimizer {
        inner,
        num_vars,
        steps: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(opt: &str, lr: f64, momentum: f64) -> TrainConfig {
        TrainConfig {
            opt: opt.to_string(),
            lr,
            momentum,
            weight_decay: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_sgd_momentum_updates() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1.0f32], &device)?;
        let mut opt = MomentumSgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                momentum: 0.9,
                weight_decay: 0.0,
            },
        )?;

        // d/dw (2w) = 2: buf = 2, w = 1 - 0.2 = 0.8
        opt.backward_step(&(w.as_tensor() * 2.0)?.sum_all()?)?;
        let after_one = w.as_tensor().to_vec1::<f32>()?[0];
        assert!((after_one - 0.8).abs() < 1e-6);

        // buf = 0.9 * 2 + 2 = 3.8, w = 0.8 - 0.38 = 0.42
        opt.backward_step(&(w.as_tensor() * 2.0)?.sum_all()?)?;
        let after_two = w.as_tensor().to_vec1::<f32>()?[0];
        assert!((after_two - 0.42).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[0.5f32, -0.5], &device)?;
        let mut opt = Adam::new(
            vec![w.clone()],
            ParamsAdam {
                lr: 0.01,
                ..Default::default()
            },
        )?;

        // The bias-corrected first step has magnitude ~lr regardless of the gradient scale
        opt.backward_step(&(w.as_tensor() * 3.0)?.sum_all()?)?;
        let values = w.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.49).abs() < 1e-4);
        assert!((values[1] + 0.51).abs() < 1e-4);

        Ok(())
    }

    #[test]
    fn test_build_optimizer_deduplicates_and_counts() -> crate::Result<()> {
        let device = Device::Cpu;
        let a = Var::zeros((2, 2), DType::F32, &device)?;
        let b = Var::zeros(3, DType::F32, &device)?;

        let mut opt = build_optimizer(vec![a.clone(), b.clone(), a.clone()], &config("adam", 0.01, 0.0))?;
        assert_eq!(opt.num_vars(), 2);
        assert_eq!(opt.steps(), 0);

        opt.backward_step(&a.as_tensor().sum_all()?)?;
        opt.backward_step(&b.as_tensor().sum_all()?)?;
        assert_eq!(opt.steps(), 2);
        Ok(())
    }

    #[test]
    fn test_untouched_group_is_not_updated() -> crate::Result<()> {
        let device = Device::Cpu;
        let owned = Var::new(&[1.0f32], &device)?;
        let foreign = Var::new(&[1.0f32], &device)?;

        let mut opt = build_optimizer(vec![owned.clone()], &config("sgd", 0.5, 0.0))?;
        let loss = (owned.as_tensor() + foreign.as_tensor())?.sum_all()?;
        opt.backward_step(&loss)?;

        assert!((owned.as_tensor().to_vec1::<f32>()?[0] - 0.5).abs() < 1e-6);
        assert_eq!(foreign.as_tensor().to_vec1::<f32>()?[0], 1.0);
        Ok(())
    }

    #[test]
    fn test_learning_rate_roundtrip() -> crate::Result<()> {
        let mut opt = build_optimizer(vec![], &config("sgd", 0.01, 0.9))?;
        assert_eq!(opt.learning_rate(), 0.01);
        opt.set_learning_rate(0.002);
        assert_eq!(opt.learning_rate(), 0.002);
        Ok(())
    }

    #[test]
    fn test_unknown_optimizer() {
        let result = build_optimizer(vec![], &config("lamb", 0.01, 0.0));
        assert!(matches!(result, Err(crate::DaError::Configuration(_))));
    }
}
