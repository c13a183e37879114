/// Networks of the multi-source adversarial (MSTLN) trainer
use candle_core::{bail, Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{linear, ops, Linear, VarBuilder};

use super::Network;
use crate::layers::{FeatureExtractor, MlpCritic};

/// Hidden width of the per-source critics
const CRITIC_HIDDEN: usize = 64;

/// Shared feature extractor with one open-set head per source
///
/// Each head predicts `num_classes + 1` probabilities; the last column is the
/// "unknown" class.
pub struct MstlnNet {
    features: FeatureExtractor,
    heads: Vec<Linear>,
}

impl MstlnNet {
    pub fn new(
        in_channels: usize,
        num_classes: usize,
        num_sources: usize,
        feature_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let features = FeatureExtractor::new(in_channels, feature_dim, 0.0, vb.pp("features"))?;
        let mut heads = Vec::with_capacity(num_sources);
        for i in 0..num_sources {
            heads.push(linear(feature_dim, num_classes + 1, vb.pp(format!("head_{}", i)))?);
        }
        Ok(Self { features, heads })
    }

    pub fn num_sources(&self) -> usize {
        self.heads.len()
    }

    /// Returns (features `[batch, feature_dim]`, probabilities `[batch, classes + 1]`)
    pub fn forward(&self, xs: &Tensor, source_idx: usize) -> Result<(Tensor, Tensor)> {
        let head = match self.heads.get(source_idx) {
            Some(head) => head,
            None => bail!("source index {} out of range for {} heads", source_idx, self.heads.len()),
        };

        let feat = self.features.forward_t(xs, true)?;
        let probs = ops::softmax(&head.forward(&feat)?, D::Minus1)?;
        Ok((feat, probs))
    }

    /// Probabilities averaged over every source head
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        let feat = self.features.forward_t(xs, false)?;
        let probs = self
            .heads
            .iter()
            .map(|head| ops::softmax(&head.forward(&feat)?, D::Minus1))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&probs, 0)?.mean(0)
    }
}

/// One Wasserstein critic per source, each over the shared feature space
pub fn build_critics(num_sources: usize, feature_dim: usize, device: &Device) -> Result<Network<Vec<MlpCritic>>> {
    Network::build("critics", device, |vb| {
        (0..num_sources)
            .map(|i| MlpCritic::new(feature_dim, CRITIC_HIDDEN, 1, vb.pp(format!("critic_{}", i))))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_open_set_head() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let net = MstlnNet::new(1, 3, 2, 16, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let xs = Tensor::randn(0f32, 1.0, (4, 1, 32), &device)?;

        let (feat, probs) = net.forward(&xs, 1)?;
        assert_eq!(feat.dims(), &[4, 16]);
        assert_eq!(probs.dims(), &[4, 4]);
        assert_eq!(net.predict(&xs)?.dims(), &[4, 4]);
        assert!(net.forward(&xs, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_critics_are_separate() -> Result<()> {
        let device = Device::Cpu;
        let critics = build_critics(3, 16, &device)?;
        assert_eq!(critics.len(), 3);
        // hidden (16x64 + 64) and out (64x1 + 1) per critic
        assert_eq!(critics.num_parameters(), 3 * (16 * 64 + 64 + 64 + 1));
        Ok(())
    }
}
