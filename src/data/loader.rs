/// Mini-batch loader over a domain dataset
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::DomainDataset;

/// Data loader yielding `[batch, 1, seq_len]` signals and `[batch]` labels
///
/// The trailing incomplete batch of every pass is dropped.
pub struct DomainLoader {
    dataset: DomainDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl DomainLoader {
    /// Create new data loader
    pub fn new(dataset: DomainDataset, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            indices.shuffle(&mut rng);
        }

        Self {
            dataset,
            batch_size,
            current_idx: 0,
            indices,
            shuffle,
            rng,
        }
    }

    /// Get next batch (signals, labels)
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        let end_idx = self.current_idx + self.batch_size;
        if self.batch_size == 0 || end_idx > self.indices.len() {
            return Ok(None);
        }

        let batch_indices = &self.indices[self.current_idx..end_idx];
        let seq_len = self.dataset.seq_len();

        let mut signal_data = Vec::with_capacity(self.batch_size * seq_len);
        let mut label_data = Vec::with_capacity(self.batch_size);
        for &idx in batch_indices {
            signal_data.extend(self.dataset.signal(idx).iter().copied());
            label_data.push(self.dataset.label(idx));
        }

        self.current_idx = end_idx;

        let signals = Tensor::from_vec(signal_data, (self.batch_size, 1, seq_len), device)?;
        let labels = Tensor::from_vec(label_data, self.batch_size, device)?;

        Ok(Some((signals, labels)))
    }

    /// Reset loader for new pass
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get number of complete batches
    pub fn num_batches(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        self.dataset.len() / self.batch_size
    }
}

impl super::BatchDataLoader for DomainLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        DomainLoader::next_batch(self, device)
    }

    fn reset(&mut self) {
        DomainLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        DomainLoader::num_batches(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::{synthetic_dataset, SEQ_LEN};

    #[test]
    fn test_drop_last() -> Result<()> {
        let device = Device::Cpu;
        // 10 samples, batch 4: two full batches, the remaining 2 are dropped
        let dataset = synthetic_dataset("A", 5, 2, 0.0);
        let mut loader = DomainLoader::new(dataset, 4, false, None);

        assert_eq!(loader.num_batches(), 2);
        assert!(loader.next_batch(&device)?.is_some());
        assert!(loader.next_batch(&device)?.is_some());
        assert!(loader.next_batch(&device)?.is_none());

        Ok(())
    }

    #[test]
    fn test_batch_shapes() -> Result<()> {
        let device = Device::Cpu;
        let dataset = synthetic_dataset("A", 4, 3, 0.0);
        let mut loader = DomainLoader::new(dataset, 4, true, Some(7));

        let (signals, labels) = loader.next_batch(&device)?.unwrap();
        assert_eq!(signals.dims(), &[4, 1, SEQ_LEN]);
        assert_eq!(labels.dims(), &[4]);
        assert_eq!(labels.dtype(), candle_core::DType::U32);

        Ok(())
    }

    #[test]
    fn test_seeded_shuffle_is_repeatable() -> Result<()> {
        let device = Device::Cpu;
        let mut a = DomainLoader::new(synthetic_dataset("A", 4, 3, 0.0), 6, true, Some(11));
        let mut b = DomainLoader::new(synthetic_dataset("A", 4, 3, 0.0), 6, true, Some(11));

        let (_, la) = a.next_batch(&device)?.unwrap();
        let (_, lb) = b.next_batch(&device)?.unwrap();
        assert_eq!(la.to_vec1::<u32>()?, lb.to_vec1::<u32>()?);

        Ok(())
    }
}
