//! Multi-source domain adaptation for vibration fault diagnosis
//!
//! Training orchestration for fault-diagnosis classifiers that learn from
//! several labeled source domains and transfer to one partially-labeled
//! target domain.
//!
//! # Trainers
//!
//! - **Single source**: supervised or adversarial training against one source
//!   (training modes 0-3, chosen from the model name)
//! - **MSTLN**: per-source Wasserstein critics with class-balanced MMD and
//!   cross-source target alignment
//! - **MAN-MoE**: shared/private features routed through a mixture of experts,
//!   trained against a multi-domain discriminator
//!
//! # Example
//!
//! ```ignore
//! use multisource_da::{TrainConfig, data::NumpyProvider, training};
//!
//! let config = TrainConfig::from_json_file("run.json")?;
//! let provider = NumpyProvider::new(&config.data_dir, config.normalization()?);
//! let report = training::run(&config, &provider)?;
//! println!("best val-acc {:.4} at epoch {}", report.best.acc, report.best.epoch);
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod losses;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::TrainConfig;
pub use training::{run, TrainerKind, TrainingReport};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum DaError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Domain lookup error: no dataset named '{0}'")]
    DomainLookup(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, DaError>;
