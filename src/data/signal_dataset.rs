/// Vibration signal datasets (.npy format) and dataset providers
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use super::{DatasetProvider, Normalization};

/// Labeled single-channel signals of one domain split
#[derive(Debug, Clone)]
pub struct DomainDataset {
    name: String,
    signals: Array2<f32>, // [N, seq_len]
    labels: Vec<u32>,     // [N]
}

impl DomainDataset {
    pub fn new(name: &str, signals: Array2<f32>, labels: Vec<u32>) -> crate::Result<Self> {
        if signals.nrows() != labels.len() {
            return Err(crate::DaError::Configuration(format!(
                "Shape mismatch in '{}': {} signals but {} labels",
                name,
                signals.nrows(),
                labels.len()
            )));
        }

        Ok(Self {
            name: name.to_string(),
            signals,
            labels,
        })
    }

    /// Load `signals.npy` and `labels.npy` from a directory
    pub fn from_directory<P: AsRef<Path>>(
        name: &str,
        path: P,
        normalization: Normalization,
    ) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading domain '{}' from: {:?}", name, dir);

        // float64 first, then float32
        let signals_path = dir.join("signals.npy");
        let mut signals = match Array2::<f64>::read_npy(File::open(&signals_path)?) {
            Ok(raw) => raw.mapv(|x| x as f32),
            Err(ReadNpyError::WrongDescriptor(_)) => {
                Array2::<f32>::read_npy(File::open(&signals_path)?)?
            }
            Err(e) => return Err(e.into()),
        };

        let labels_path = dir.join("labels.npy");
        let labels_i64 = Array1::<i64>::read_npy(File::open(&labels_path)?)?;
        if labels_i64.iter().any(|&l| l < 0) {
            return Err(crate::DaError::Configuration(format!(
                "Negative class label in {:?}",
                labels_path
            )));
        }
        let labels: Vec<u32> = labels_i64.iter().map(|&l| l as u32).collect();

        for mut row in signals.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                normalization.apply(slice);
            } else {
                let mut owned = row.to_vec();
                normalization.apply(&mut owned);
                row.assign(&ArrayView1::from(&owned));
            }
        }

        log::info!(
            "Domain '{}' loaded: {} examples, seq_len={}",
            name,
            signals.nrows(),
            signals.ncols()
        );

        Self::new(name, signals, labels)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.signals.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.nrows() == 0
    }

    /// Get signal length
    pub fn seq_len(&self) -> usize {
        self.signals.ncols()
    }

    pub fn signal(&self, idx: usize) -> ArrayView1<f32> {
        self.signals.row(idx)
    }

    pub fn label(&self, idx: usize) -> u32 {
        self.labels[idx]
    }

    /// Examples per class label
    pub fn class_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Log a one-line description of the split
    pub fn summary(&self) {
        let counts: Vec<String> = self
            .class_counts()
            .iter()
            .map(|(label, count)| format!("{}:{}", label, count))
            .collect();
        log::info!(
            "{}: {} samples of length {} [{}]",
            self.name,
            self.len(),
            self.seq_len(),
            counts.join(" ")
        );
    }
}

/// Reads domains laid out as `<data_dir>/<name>/{signals,labels}.npy`
///
/// The target domain keeps its splits in `<name>/train` and `<name>/val`.
pub struct NumpyProvider {
    data_dir: PathBuf,
    normalization: Normalization,
}

impl NumpyProvider {
    pub fn new<P: AsRef<Path>>(data_dir: P, normalization: Normalization) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            normalization,
        }
    }

    fn domain_dir(&self, name: &str) -> crate::Result<PathBuf> {
        let dir = self.data_dir.join(name);
        if !dir.is_dir() {
            return Err(crate::DaError::DomainLookup(name.to_string()));
        }
        Ok(dir)
    }
}

impl DatasetProvider for NumpyProvider {
    fn source(&self, name: &str) -> crate::Result<DomainDataset> {
        let dir = self.domain_dir(name)?;
        DomainDataset::from_directory(name, dir, self.normalization)
    }

    fn target(&self, name: &str) -> crate::Result<(DomainDataset, DomainDataset)> {
        let dir = self.domain_dir(name)?;
        let train = DomainDataset::from_directory(&format!("{}/train", name), dir.join("train"), self.normalization)?;
        let val = DomainDataset::from_directory(&format!("{}/val", name), dir.join("val"), self.normalization)?;
        Ok((train, val))
    }
}

/// Provider over datasets that are already in memory
#[derive(Default)]
pub struct InMemoryProvider {
    sources: HashMap<String, DomainDataset>,
    targets: HashMap<String, (DomainDataset, DomainDataset)>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, dataset: DomainDataset) {
        self.sources.insert(dataset.name().to_string(), dataset);
    }

    /// Register the target splits under the train split's name
    pub fn add_target(&mut self, train: DomainDataset, val: DomainDataset) {
        self.targets.insert(train.name().to_string(), (train, val));
    }
}

impl DatasetProvider for InMemoryProvider {
    fn source(&self, name: &str) -> crate::Result<DomainDataset> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| crate::DaError::DomainLookup(name.to_string()))
    }

    fn target(&self, name: &str) -> crate::Result<(DomainDataset, DomainDataset)> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| crate::DaError::DomainLookup(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::synthetic_dataset;
    use ndarray_npy::WriteNpyExt;

    #[test]
    fn test_shape_mismatch_rejected() {
        let signals = Array2::<f32>::zeros((4, 8));
        let result = DomainDataset::new("bad", signals, vec![0, 1, 2]);
        assert!(matches!(result, Err(crate::DaError::Configuration(_))));
    }

    #[test]
    fn test_class_counts() {
        let dataset = synthetic_dataset("A", 5, 3, 0.0);
        let counts = dataset.class_counts();
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 5));
    }

    #[test]
    fn test_in_memory_lookup() {
        let mut provider = InMemoryProvider::new();
        provider.add_source(synthetic_dataset("CWRU", 2, 3, 0.0));

        assert_eq!(provider.source("CWRU").unwrap().len(), 6);
        assert!(matches!(
            provider.source("MFPT"),
            Err(crate::DaError::DomainLookup(name)) if name == "MFPT"
        ));
        assert!(matches!(provider.target("PU"), Err(crate::DaError::DomainLookup(_))));
    }

    #[test]
    fn test_numpy_provider_missing_domain() {
        let provider = NumpyProvider::new(std::env::temp_dir(), Normalization::ZeroOne);
        let result = provider.source("no_such_domain_for_msda_tests");
        assert!(matches!(result, Err(crate::DaError::DomainLookup(_))));
    }

    #[test]
    fn test_numpy_provider_reads_source() -> crate::Result<()> {
        let root = std::env::temp_dir().join(format!("msda_npy_{}", std::process::id()));
        let dir = root.join("CWRU");
        std::fs::create_dir_all(&dir)?;

        let signals = Array2::from_shape_fn((4, 6), |(i, t)| (i * 10 + t) as f64);
        signals.write_npy(File::create(dir.join("signals.npy"))?).unwrap();
        let labels = Array1::from(vec![0i64, 1, 2, 1]);
        labels.write_npy(File::create(dir.join("labels.npy"))?).unwrap();

        let provider = NumpyProvider::new(&root, Normalization::ZeroOne);
        let dataset = provider.source("CWRU")?;

        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.seq_len(), 6);
        assert_eq!(dataset.label(2), 2);
        assert!((dataset.signal(1)[0] - 0.0).abs() < 1e-6);
        assert!((dataset.signal(1)[5] - 1.0).abs() < 1e-6);

        std::fs::remove_dir_all(&root).ok();
        Ok(())
    }
}
