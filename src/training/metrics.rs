/// Per-epoch bookkeeping shared by the trainers
use std::collections::BTreeMap;

/// Named running sums, averaged over the iterations of one epoch
#[derive(Debug, Default, Clone)]
pub struct EpochMetrics {
    sums: BTreeMap<String, f64>,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Running sum of `name`, 0 when never recorded
    pub fn sum(&self, name: &str) -> f64 {
        self.sums.get(name).copied().unwrap_or(0.0)
    }

    /// Every sum divided by `iterations`
    pub fn finalize(&self, iterations: usize) -> BTreeMap<String, f64> {
        let iterations = iterations.max(1) as f64;
        self.sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / iterations))
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
    }
}

/// Best validation accuracy seen so far and the epoch it was reached at
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct BestAccuracy {
    pub acc: f64,
    pub epoch: usize,
}

impl BestAccuracy {
    /// Record `acc` if it strictly improves the best; returns whether it did
    pub fn observe(&mut self, epoch: usize, acc: f64) -> bool {
        if acc > self.acc {
            self.acc = acc;
            self.epoch = epoch;
            true
        } else {
            false
        }
    }
}

/// Summary of one finished epoch
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_acc: f64,
    pub val_acc: f64,
    /// Averaged loss components and auxiliary accuracies
    pub losses: BTreeMap<String, f64>,
    /// Source pairs aligned per iteration (MSTLN only)
    pub pairs_per_iteration: Option<usize>,
}

/// Outcome of a complete training run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TrainingReport {
    pub best: BestAccuracy,
    pub epochs: Vec<EpochReport>,
    /// Steps taken by the feature/classifier optimizer
    pub generator_steps: usize,
    /// Steps taken by the critic or discriminator optimizer
    pub discriminator_steps: usize,
}

impl TrainingReport {
    pub fn last_epoch(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }
}

/// Format averaged metrics as `name: value` pairs for a log line
pub fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{}: {:.4}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}
