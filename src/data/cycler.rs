/// Endless per-stream batch iteration
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fmt;

use super::BatchDataLoader;

/// Identifies one batch stream of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    /// Labeled source domain, by position in the configured source list
    Source(usize),
    /// Target domain training split
    Target,
    /// Target domain validation split
    Validation,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Source(idx) => write!(f, "source[{}]", idx),
            Stream::Target => write!(f, "train"),
            Stream::Validation => write!(f, "val"),
        }
    }
}

/// Signals `[batch, 1, seq_len]` and labels `[batch]`
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

/// Owns one loader per stream and never runs dry: an exhausted loader is
/// reset and the first batch of the new pass is returned instead.
pub struct BatchCycler {
    device: Device,
    loaders: HashMap<Stream, Box<dyn BatchDataLoader>>,
    restarts: HashMap<Stream, usize>,
}

impl BatchCycler {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            loaders: HashMap::new(),
            restarts: HashMap::new(),
        }
    }

    pub fn insert<L: BatchDataLoader + 'static>(&mut self, stream: Stream, loader: L) {
        self.loaders.insert(stream, Box::new(loader));
        self.restarts.insert(stream, 0);
    }

    /// Next batch of `stream`, starting a new pass when the current one ends
    pub fn next(&mut self, stream: Stream) -> crate::Result<Batch> {
        let loader = self
            .loaders
            .get_mut(&stream)
            .ok_or_else(|| crate::DaError::Training(format!("no loader for stream {}", stream)))?;

        if let Some((inputs, labels)) = loader.next_batch(&self.device)? {
            return Ok(Batch { inputs, labels });
        }

        loader.reset();
        *self.restarts.entry(stream).or_insert(0) += 1;
        log::debug!("Stream {} exhausted, starting a new pass", stream);

        match loader.next_batch(&self.device)? {
            Some((inputs, labels)) => Ok(Batch { inputs, labels }),
            None => Err(crate::DaError::Training(format!(
                "stream {} holds fewer samples than one batch",
                stream
            ))),
        }
    }

    /// Complete batches per pass of `stream`
    pub fn num_batches(&self, stream: Stream) -> crate::Result<usize> {
        self.loaders
            .get(&stream)
            .map(|loader| loader.num_batches())
            .ok_or_else(|| crate::DaError::Training(format!("no loader for stream {}", stream)))
    }

    /// How many times `stream` has been restarted
    pub fn restarts(&self, stream: Stream) -> usize {
        self.restarts.get(&stream).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::synthetic_dataset;
    use crate::data::DomainLoader;

    fn cycler_with(stream: Stream, per_class: usize, batch_size: usize) -> BatchCycler {
        let mut cycler = BatchCycler::new(Device::Cpu);
        let dataset = synthetic_dataset("A", per_class, 2, 0.0);
        cycler.insert(stream, DomainLoader::new(dataset, batch_size, false, None));
        cycler
    }

    #[test]
    fn test_wraps_without_error() -> crate::Result<()> {
        // 10 samples, batch 4: 2 batches per pass
        let mut cycler = cycler_with(Stream::Validation, 5, 4);
        assert_eq!(cycler.num_batches(Stream::Validation)?, 2);

        let first = cycler.next(Stream::Validation)?;
        cycler.next(Stream::Validation)?;
        assert_eq!(cycler.restarts(Stream::Validation), 0);

        // Third call crosses the boundary and restarts the sequential pass
        let wrapped = cycler.next(Stream::Validation)?;
        assert_eq!(cycler.restarts(Stream::Validation), 1);
        assert_eq!(
            first.labels.to_vec1::<u32>()?,
            wrapped.labels.to_vec1::<u32>()?
        );
        let diff = (first.inputs - wrapped.inputs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        Ok(())
    }

    #[test]
    fn test_streams_are_independent() -> crate::Result<()> {
        let mut cycler = BatchCycler::new(Device::Cpu);
        cycler.insert(Stream::Source(0), DomainLoader::new(synthetic_dataset("A", 4, 2, 0.0), 4, false, None));
        cycler.insert(Stream::Target, DomainLoader::new(synthetic_dataset("B", 4, 2, 0.5), 4, false, None));

        for _ in 0..5 {
            cycler.next(Stream::Source(0))?;
        }
        cycler.next(Stream::Target)?;

        assert_eq!(cycler.restarts(Stream::Source(0)), 2);
        assert_eq!(cycler.restarts(Stream::Target), 0);
        Ok(())
    }

    #[test]
    fn test_too_small_stream_errors() {
        let mut cycler = cycler_with(Stream::Target, 1, 8);
        assert!(matches!(cycler.next(Stream::Target), Err(crate::DaError::Training(_))));
    }

    #[test]
    fn test_unknown_stream_errors() {
        let mut cycler = BatchCycler::new(Device::Cpu);
        assert!(cycler.next(Stream::Source(3)).is_err());
        assert!(cycler.num_batches(Stream::Source(3)).is_err());
    }
}
