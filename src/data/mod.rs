/// Data loading modules for domain adaptation training
pub mod cycler;
pub mod loader;
pub mod signal_dataset;

pub use cycler::{Batch, BatchCycler, Stream};
pub use loader::DomainLoader;
pub use signal_dataset::{DomainDataset, InMemoryProvider, NumpyProvider};

use candle_core::{Device, Result, Tensor};
use std::str::FromStr;

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch of (input, label) tensors, `None` once the pass is over
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for a new pass
    fn reset(&mut self);

    /// Get number of complete batches per pass
    fn num_batches(&self) -> usize;
}

/// Source of labeled domain datasets, looked up by name
pub trait DatasetProvider {
    /// Single labeled split of a source domain
    fn source(&self, name: &str) -> crate::Result<DomainDataset>;

    /// (train, val) splits of the target domain
    fn target(&self, name: &str) -> crate::Result<(DomainDataset, DomainDataset)>;
}

/// Per-sample signal normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Scale into [0, 1]
    ZeroOne,
    /// Scale into [-1, 1]
    MinusOneOne,
    /// Zero mean, unit variance
    MeanStd,
}

impl FromStr for Normalization {
    type Err = crate::DaError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "0-1" => Ok(Self::ZeroOne),
            "-1-1" => Ok(Self::MinusOneOne),
            "mean-std" => Ok(Self::MeanStd),
            other => Err(crate::DaError::Configuration(format!(
                "Invalid normalization: {}. Must be '0-1', '-1-1', or 'mean-std'",
                other
            ))),
        }
    }
}

impl Normalization {
    /// Normalize one signal in place
    pub fn apply(&self, signal: &mut [f32]) {
        if signal.is_empty() {
            return;
        }
        match self {
            Self::ZeroOne | Self::MinusOneOne => {
                let min = signal.iter().copied().fold(f32::INFINITY, f32::min);
                let max = signal.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let range = (max - min).max(f32::EPSILON);
                for x in signal.iter_mut() {
                    let unit = (*x - min) / range;
                    *x = if *self == Self::ZeroOne { unit } else { 2.0 * unit - 1.0 };
                }
            }
            Self::MeanStd => {
                let n = signal.len() as f32;
                let mean = signal.iter().sum::<f32>() / n;
                let var = signal.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
                let std = var.sqrt().max(f32::EPSILON);
                for x in signal.iter_mut() {
                    *x = (*x - mean) / std;
                }
            }
        }
    }
}
