/// Run configuration for the domain adaptation trainers
///
/// One field per command-line option of a training run, loaded from JSON.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::data::Normalization;
use crate::training::optimizer::OptimizerKind;
use crate::training::scheduler::ScheduleKind;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Model name; selects the trainer and, for single-source runs, the mode
    pub model_name: String,

    /// Names of the labeled source domains
    pub source_names: Vec<String>,

    /// Name of the target domain
    pub target_name: String,

    /// Root directory holding one sub-directory per domain
    pub data_dir: String,

    /// Per-sample normalization: "0-1", "-1-1" or "mean-std"
    pub normalization: String,

    /// CUDA ordinal; `None` runs on the CPU
    pub cuda_device: Option<usize>,

    /// Directory for periodic checkpoints
    pub checkpoint_dir: String,

    pub batch_size: usize,

    /// Number of known fault classes
    pub num_classes: usize,

    /// Optimizer: "sgd" or "adam"
    pub opt: String,

    /// Initial learning rate
    pub lr: f64,

    /// Momentum for sgd
    pub momentum: f64,

    pub weight_decay: f64,

    /// Learning rate schedule: "step", "exp", "stepLR" or "fix"
    pub lr_scheduler: String,

    /// Decay factor for step, exp and stepLR
    pub gamma: f64,

    /// Milestones ("10,20") for step, interval ("10") for stepLR
    pub steps: String,

    /// Coefficients of the auxiliary loss terms
    pub tradeoff: Vec<f64>,

    /// Dropout probability inside the MAN-MoE feature extractors
    pub dropout: f32,

    /// Training runs `max_epoch + 1` epochs
    pub max_epoch: usize,

    /// Checkpoint interval in epochs; 0 disables saving
    pub save_step: usize,

    /// Outer iterations per MSTLN epoch
    pub mstln_iterations: usize,

    /// Width of the feature vectors fed to the critics
    pub feature_dim: usize,

    /// Seed for batch shuffling
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "DAN".to_string(),
            source_names: vec!["CWRU".to_string(), "MFPT".to_string()],
            target_name: "PU".to_string(),
            data_dir: "./dataset".to_string(),
            normalization: "-1-1".to_string(),
            cuda_device: None,
            checkpoint_dir: "./Ckpt_2src".to_string(),
            batch_size: 64,
            num_classes: 3,
            opt: "adam".to_string(),
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
            lr_scheduler: "stepLR".to_string(),
            gamma: 0.2,
            steps: "10".to_string(),
            tradeoff: vec![0.01, 0.01, 0.002],
            dropout: 0.0,
            max_epoch: 30,
            save_step: 0,
            mstln_iterations: 3,
            feature_dim: 256,
            seed: None,
        }
    }
}

impl TrainConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.source_names.is_empty() {
            return Err(crate::DaError::Configuration(
                "at least one source domain is required".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(crate::DaError::Configuration(
                "batch_size must be > 0".to_string(),
            ));
        }

        if self.num_classes == 0 {
            return Err(crate::DaError::Configuration(
                "num_classes must be > 0".to_string(),
            ));
        }

        if self.tradeoff.len() < 3 {
            return Err(crate::DaError::Configuration(format!(
                "tradeoff needs 3 coefficients, got {}",
                self.tradeoff.len()
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(crate::DaError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }

        // Surface unknown names before any data is touched
        self.normalization()?;
        self.optimizer_kind()?;
        self.schedule_kind()?;

        Ok(())
    }

    pub fn normalization(&self) -> crate::Result<Normalization> {
        self.normalization.parse()
    }

    pub fn optimizer_kind(&self) -> crate::Result<OptimizerKind> {
        self.opt.parse()
    }

    pub fn schedule_kind(&self) -> crate::Result<Option<ScheduleKind>> {
        ScheduleKind::parse(&self.lr_scheduler, &self.steps, self.gamma)
    }
}
