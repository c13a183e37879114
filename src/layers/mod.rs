/// Neural network building blocks
///
/// This module contains the layers the reference networks are assembled from:
/// - 1-D convolutional feature extraction for single-channel signals
/// - Mixture-of-experts routing (feature experts and classifier experts)
/// - Critics and domain discriminators

pub mod critic;
pub mod experts;
pub mod feature;

pub use critic::{DomainDiscriminator, MlpCritic};
pub use experts::{MixtureOfExperts, MoeClassifier};
pub use feature::FeatureExtractor;
