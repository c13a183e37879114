/// Critics and domain discriminators
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, ops, Linear, VarBuilder};

use crate::losses::Critic;

/// Two-layer ReLU critic `D(x) = W₂ relu(W₁x + b₁) + b₂`
pub struct MlpCritic {
    hidden: Linear,
    out: Linear,
}

impl MlpCritic {
    pub fn new(input_size: usize, hidden_size: usize, output_size: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = linear(input_size, hidden_size, vb.pp("hidden"))?;
        let out = linear(hidden_size, output_size, vb.pp("out"))?;
        Ok(Self { hidden, out })
    }
}

impl Critic for MlpCritic {
    fn score(&self, xs: &Tensor) -> Result<Tensor> {
        self.out.forward(&self.hidden.forward(xs)?.relu()?)
    }

    fn input_gradient(&self, xs: &Tensor) -> Result<Tensor> {
        // d(Σₖ Dₖ)/dx = W₁ᵀ (relu'(W₁x + b₁) ⊙ Σₖ W₂[k, :])
        let pre = self.hidden.forward(xs)?;
        let active = pre.gt(0.0)?.to_dtype(pre.dtype())?;
        let out_sum = self.out.weight().sum(0)?;
        active.broadcast_mul(&out_sum)?.matmul(self.hidden.weight())
    }
}

impl Module for MlpCritic {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.score(xs)
    }
}

/// Domain classifier emitting log-probabilities over `num_domains`
pub struct DomainDiscriminator {
    hidden: Linear,
    out: Linear,
}

impl DomainDiscriminator {
    pub fn new(input_size: usize, hidden_size: usize, num_domains: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = linear(input_size, hidden_size, vb.pp("hidden"))?;
        let out = linear(hidden_size, num_domains, vb.pp("out"))?;
        Ok(Self { hidden, out })
    }
}

impl Module for DomainDiscriminator {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.out.forward(&self.hidden.forward(xs)?.relu()?)?;
        ops::log_softmax(&logits, D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_input_gradient_matches_autograd() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let critic = MlpCritic::new(6, 5, 2, vb)?;

        let xs = Var::new(&[[0.3f32, -1.2, 0.5, 2.0, -0.1, 0.7], [1.1, 0.4, -0.9, 0.2, 0.3, -1.5]], &device)?;
        let grads = critic.score(xs.as_tensor())?.sum_all()?.backward()?;
        let expected = grads.get(xs.as_tensor()).expect("gradient for input");

        let analytic = critic.input_gradient(xs.as_tensor())?;
        let diff = (analytic - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "max difference {}", diff);
        Ok(())
    }

    #[test]
    fn test_discriminator_log_probs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let disc = DomainDiscriminator::new(8, 16, 3, vb)?;

        let xs = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
        let log_probs = disc.forward(&xs)?;
        assert_eq!(log_probs.dims(), &[4, 3]);

        let sums = log_probs.exp()?.sum(1)?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }
}
