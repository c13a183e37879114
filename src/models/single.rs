/// Networks of the single-source trainer, one per training mode
///
/// Every network shares the same 1-D CNN backbone; they differ in the loss
/// terms their training forward pass returns.
use candle_core::{bail, Module, ModuleT, Result, Tensor, D};
use candle_nn::{linear, loss, ops, Linear, VarBuilder};

use crate::layers::FeatureExtractor;
use crate::losses::mmd;

/// Width of the backbone features
const FEATURE_DIM: usize = 64;
/// Width of the per-source private features of `DiscrepancyNet`
const PRIVATE_DIM: usize = 32;

/// Mode 0: backbone and a linear head trained with cross-entropy
pub struct PlainClassifier {
    features: FeatureExtractor,
    head: Linear,
}

impl PlainClassifier {
    pub fn new(in_channels: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = FeatureExtractor::new(in_channels, FEATURE_DIM, 0.0, vb.pp("features"))?;
        let head = linear(FEATURE_DIM, num_classes, vb.pp("head"))?;
        Ok(Self { features, head })
    }

    /// Returns (source logits, classification loss)
    pub fn forward(&self, source: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        let logits = self.head.forward(&self.features.forward_t(source, true)?)?;
        let loss = loss::cross_entropy(&logits, labels)?;
        Ok((logits, loss))
    }

    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        self.head.forward(&self.features.forward_t(xs, false)?)
    }
}

/// Mode 1: classification on the source plus MMD between source and target
/// features
pub struct AlignmentNet {
    features: FeatureExtractor,
    head: Linear,
}

impl AlignmentNet {
    pub fn new(in_channels: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = FeatureExtractor::new(in_channels, FEATURE_DIM, 0.0, vb.pp("features"))?;
        let head = linear(FEATURE_DIM, num_classes, vb.pp("head"))?;
        Ok(Self { features, head })
    }

    /// Returns (target logits, classification loss, adaptation loss)
    pub fn forward(&self, target: &Tensor, source: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let src_feat = self.features.forward_t(source, true)?;
        let tgt_feat = self.features.forward_t(target, true)?;

        let clf_loss = loss::cross_entropy(&self.head.forward(&src_feat)?, labels)?;
        let adapt_loss = mmd(&src_feat, &tgt_feat, None)?;

        Ok((self.head.forward(&tgt_feat)?, clf_loss, adapt_loss))
    }

    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        self.head.forward(&self.features.forward_t(xs, false)?)
    }
}

/// Mode 2: shared backbone with a private layer and head per source
///
/// The extra terms are the MMD between source and target private features
/// and the discrepancy between the heads' target predictions.
pub struct DiscrepancyNet {
    shared: FeatureExtractor,
    private: Vec<Linear>,
    heads: Vec<Linear>,
}

impl DiscrepancyNet {
    pub fn new(in_channels: usize, num_classes: usize, num_sources: usize, vb: VarBuilder) -> Result<Self> {
        let shared = FeatureExtractor::new(in_channels, FEATURE_DIM, 0.0, vb.pp("shared"))?;
        let mut private = Vec::with_capacity(num_sources);
        let mut heads = Vec::with_capacity(num_sources);
        for i in 0..num_sources {
            private.push(linear(FEATURE_DIM, PRIVATE_DIM, vb.pp(format!("private_{}", i)))?);
            heads.push(linear(PRIVATE_DIM, num_classes, vb.pp(format!("head_{}", i)))?);
        }
        Ok(Self { shared, private, heads })
    }

    fn private_features(&self, shared: &Tensor, idx: usize) -> Result<Tensor> {
        self.private[idx].forward(shared)?.relu()
    }

    /// Target class probabilities of every head
    fn head_probs(&self, tgt_shared: &Tensor) -> Result<Vec<Tensor>> {
        (0..self.heads.len())
            .map(|j| {
                let logits = self.heads[j].forward(&self.private_features(tgt_shared, j)?)?;
                ops::softmax(&logits, D::Minus1)
            })
            .collect()
    }

    /// Returns (target probabilities, classification loss, MMD loss,
    /// head discrepancy loss)
    pub fn forward(
        &self,
        target: &Tensor,
        source: &Tensor,
        labels: &Tensor,
        source_idx: usize,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        if source_idx >= self.heads.len() {
            bail!("source index {} out of range for {} heads", source_idx, self.heads.len());
        }

        let src_shared = self.shared.forward_t(source, true)?;
        let tgt_shared = self.shared.forward_t(target, true)?;

        let src_private = self.private_features(&src_shared, source_idx)?;
        let tgt_private = self.private_features(&tgt_shared, source_idx)?;

        let clf_loss = loss::cross_entropy(&self.heads[source_idx].forward(&src_private)?, labels)?;
        let mmd_loss = mmd(&src_private, &tgt_private, None)?;

        let probs = self.head_probs(&tgt_shared)?;
        let mut disc_loss = Tensor::zeros((), clf_loss.dtype(), clf_loss.device())?;
        let others = probs.len().saturating_sub(1);
        for (j, p) in probs.iter().enumerate() {
            if j != source_idx {
                let gap = p.sub(&probs[source_idx])?.abs()?.mean_all()?;
                disc_loss = (disc_loss + (gap / others as f64)?)?;
            }
        }

        let pred = Tensor::stack(&probs, 0)?.mean(0)?;
        Ok((pred, clf_loss, mmd_loss, disc_loss))
    }

    /// Target probabilities averaged over the heads
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        let shared = self.shared.forward_t(xs, false)?;
        Tensor::stack(&self.head_probs(&shared)?, 0)?.mean(0)
    }
}

/// Mode 3: one backbone and head trained on any number of sources, aligned
/// to the target by the mean source/target MMD
pub struct MultiSourceNet {
    features: FeatureExtractor,
    head: Linear,
}

impl MultiSourceNet {
    pub fn new(in_channels: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = FeatureExtractor::new(in_channels, FEATURE_DIM, 0.0, vb.pp("features"))?;
        let head = linear(FEATURE_DIM, num_classes, vb.pp("head"))?;
        Ok(Self { features, head })
    }

    /// Returns (target logits, mean classification loss, mean MMD loss)
    pub fn forward(
        &self,
        target: &Tensor,
        sources: &[Tensor],
        labels: &[Tensor],
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        if sources.is_empty() || sources.len() != labels.len() {
            bail!(
                "expected matching non-empty source batches, got {} inputs and {} label sets",
                sources.len(),
                labels.len()
            );
        }

        let tgt_feat = self.features.forward_t(target, train)?;
        let mut clf_losses = Vec::with_capacity(sources.len());
        let mut mmd_losses = Vec::with_capacity(sources.len());
        for (source, y) in sources.iter().zip(labels) {
            let src_feat = self.features.forward_t(source, train)?;
            clf_losses.push(loss::cross_entropy(&self.head.forward(&src_feat)?, y)?);
            mmd_losses.push(mmd(&src_feat, &tgt_feat, None)?);
        }

        let clf_loss = Tensor::stack(&clf_losses, 0)?.mean(0)?;
        let mmd_loss = Tensor::stack(&mmd_losses, 0)?.mean(0)?;
        Ok((self.head.forward(&tgt_feat)?, clf_loss, mmd_loss))
    }
}
