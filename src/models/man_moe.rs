/// Networks of the mixture-of-experts (MAN-MoE) trainer
use candle_core::{Device, Module, ModuleT, Result, Tensor, Var};

use super::Network;
use crate::layers::{DomainDiscriminator, FeatureExtractor, MixtureOfExperts, MoeClassifier};

/// Width of the shared and private feature vectors
pub const FEATURE_DIM: usize = 64;
/// Hidden width of the domain discriminator
const DISCRIMINATOR_HIDDEN: usize = 64;

/// Private feature pathway: its own extractor routed through one expert per
/// source domain
pub struct PrivateExtractor {
    extractor: FeatureExtractor,
    experts: MixtureOfExperts,
}

impl PrivateExtractor {
    pub fn new(num_sources: usize, dropout: f32, vb: candle_nn::VarBuilder) -> Result<Self> {
        let extractor = FeatureExtractor::new(1, FEATURE_DIM, dropout, vb.pp("extractor"))?;
        let experts = MixtureOfExperts::new(FEATURE_DIM, num_sources, FEATURE_DIM, dropout, vb.pp("experts"))?;
        Ok(Self { extractor, experts })
    }

    /// Returns (private features, gate logits `[batch, num_sources]`)
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let feat = self.extractor.forward_t(xs, train)?;
        self.experts.forward_t(&feat, train)
    }
}

/// Shared extractor, private extractor, classifier and domain discriminator
pub struct ManMoeNets {
    pub shared: Network<FeatureExtractor>,
    pub private: Network<PrivateExtractor>,
    pub classifier: Network<MoeClassifier>,
    pub discriminator: Network<DomainDiscriminator>,
}

impl ManMoeNets {
    pub fn new(num_sources: usize, num_classes: usize, dropout: f32, device: &Device) -> Result<Self> {
        let shared = Network::build("shared", device, |vb| FeatureExtractor::new(1, FEATURE_DIM, dropout, vb))?;
        let private = Network::build("private", device, |vb| PrivateExtractor::new(num_sources, dropout, vb))?;
        let classifier = Network::build("classifier", device, |vb| {
            MoeClassifier::new(2 * FEATURE_DIM, num_sources, num_classes, vb)
        })?;
        // Sources plus the target domain
        let discriminator = Network::build("discriminator", device, |vb| {
            DomainDiscriminator::new(FEATURE_DIM, DISCRIMINATOR_HIDDEN, num_sources + 1, vb)
        })?;

        Ok(Self {
            shared,
            private,
            classifier,
            discriminator,
        })
    }

    /// Parameters updated by the feature/classifier/gate optimizer
    pub fn generator_vars(&self) -> Vec<Var> {
        let mut vars = self.shared.vars();
        vars.extend(self.private.vars());
        vars.extend(self.classifier.vars());
        vars
    }

    /// Discriminator log-probabilities over domains for shared features
    pub fn discriminate(&self, shared_feat: &Tensor) -> Result<Tensor> {
        self.discriminator.forward(shared_feat)
    }

    /// Class log-probabilities through shared + private + classifier
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        let shared = self.shared.forward_t(xs, false)?;
        let (private, _) = self.private.forward_t(xs, false)?;
        let (log_probs, _) = self.classifier.forward(&shared, &private)?;
        Ok(log_probs)
    }
}
