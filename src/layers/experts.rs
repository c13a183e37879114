/// Mixture-of-experts layers
///
/// A gate produces one logit per source domain; the expert outputs are
/// mixed with the softmax of those logits. The gate logits are returned so
/// they can be supervised with the true domain index.
use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{linear, ops, Dropout, Linear, VarBuilder};

/// Mix `[batch, experts, dim]` expert outputs with gate logits `[batch, experts]`
fn mix(expert_outputs: &[Tensor], gate_logits: &Tensor) -> Result<Tensor> {
    let stacked = Tensor::stack(expert_outputs, 1)?;
    let weights = ops::softmax(gate_logits, D::Minus1)?.unsqueeze(2)?;
    stacked.broadcast_mul(&weights)?.sum(1)
}

/// Feature-level mixture of experts, one expert per source domain
pub struct MixtureOfExperts {
    experts: Vec<Linear>,
    gate: Linear,
    dropout: Dropout,
}

impl MixtureOfExperts {
    pub fn new(
        input_size: usize,
        num_experts: usize,
        output_size: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut experts = Vec::with_capacity(num_experts);
        for i in 0..num_experts {
            experts.push(linear(input_size, output_size, vb.pp(format!("expert_{}", i)))?);
        }
        let gate = linear(input_size, num_experts, vb.pp("gate"))?;

        Ok(Self {
            experts,
            gate,
            dropout: Dropout::new(dropout),
        })
    }

    /// Returns (mixed features `[batch, output]`, gate logits `[batch, experts]`)
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let xs = self.dropout.forward_t(xs, train)?;
        let gate_logits = self.gate.forward(&xs)?;

        let outputs = self
            .experts
            .iter()
            .map(|expert| expert.forward(&xs)?.relu())
            .collect::<Result<Vec<_>>>()?;

        Ok((mix(&outputs, &gate_logits)?, gate_logits))
    }
}

/// Classifier over concatenated shared and private features with one
/// expert head per source domain
pub struct MoeClassifier {
    experts: Vec<Linear>,
    gate: Linear,
}

impl MoeClassifier {
    pub fn new(input_size: usize, num_experts: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let mut experts = Vec::with_capacity(num_experts);
        for i in 0..num_experts {
            experts.push(linear(input_size, num_classes, vb.pp(format!("expert_{}", i)))?);
        }
        let gate = linear(input_size, num_experts, vb.pp("gate"))?;

        Ok(Self { experts, gate })
    }

    /// Returns (class log-probabilities `[batch, classes]`, gate logits `[batch, experts]`)
    pub fn forward(&self, shared: &Tensor, private: &Tensor) -> Result<(Tensor, Tensor)> {
        let xs = Tensor::cat(&[shared, private], 1)?;
        let gate_logits = self.gate.forward(&xs)?;

        let outputs = self
            .experts
            .iter()
            .map(|expert| expert.forward(&xs))
            .collect::<Result<Vec<_>>>()?;

        let logits = mix(&outputs, &gate_logits)?;
        Ok((ops::log_softmax(&logits, D::Minus1)?, gate_logits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mixture_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let moe = MixtureOfExperts::new(16, 3, 8, 0.1, vb)?;

        let xs = Tensor::randn(0f32, 1.0, (5, 16), &device)?;
        let (feats, gate) = moe.forward_t(&xs, true)?;

        assert_eq!(feats.dims(), &[5, 8]);
        assert_eq!(gate.dims(), &[5, 3]);
        Ok(())
    }

    #[test]
    fn test_classifier_outputs_log_probs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let clf = MoeClassifier::new(8, 2, 3, vb)?;

        let shared = Tensor::randn(0f32, 1.0, (4, 4), &device)?;
        let private = Tensor::randn(0f32, 1.0, (4, 4), &device)?;
        let (log_probs, gate) = clf.forward(&shared, &private)?;

        assert_eq!(log_probs.dims(), &[4, 3]);
        assert_eq!(gate.dims(), &[4, 2]);

        // Rows of exp(log_probs) sum to one
        let sums = log_probs.exp()?.sum(1)?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }
}
