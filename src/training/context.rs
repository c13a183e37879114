/// Run driver: data wiring, trainer selection and shared epoch helpers
use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use super::checkpoint::save_networks;
use super::man_moe::ManMoeTrainer;
use super::metrics::TrainingReport;
use super::mstln::MstlnTrainer;
use super::single_source::SingleSourceTrainer;
use crate::data::{BatchCycler, DatasetProvider, DomainLoader, Stream};
use crate::models::ModelGroup;
use crate::utils::{accuracy, select_device};
use crate::TrainConfig;

/// Trainer selected by the configured model name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerKind {
    /// Training modes 0-3 against exactly one source
    SingleSource(ModelGroup),
    /// Per-source Wasserstein critics with open-set heads (MSTLN)
    MultiSourceAdversarial,
    /// Shared/private features with mixture-of-experts routing (MAN-MoE)
    MixtureOfExperts,
}

impl TrainerKind {
    pub fn from_model_name(name: &str) -> crate::Result<Self> {
        match name {
            "MSTLN" => Ok(Self::MultiSourceAdversarial),
            "Man_Moe" | "MAN-MoE" => Ok(Self::MixtureOfExperts),
            other => ModelGroup::from_model_name(other).map(Self::SingleSource),
        }
    }
}

/// Everything a trainer needs besides its own networks
pub struct TrainingContext {
    pub config: TrainConfig,
    pub device: Device,
    pub cycler: BatchCycler,
    pub source_names: Vec<String>,
}

impl TrainingContext {
    /// Validate `config`, select the device and load every domain
    pub fn new(config: &TrainConfig, provider: &dyn DatasetProvider) -> crate::Result<Self> {
        let device = select_device(config.cuda_device)?;
        Self::with_device(config, provider, device)
    }

    pub fn with_device(config: &TrainConfig, provider: &dyn DatasetProvider, device: Device) -> crate::Result<Self> {
        config.validate()?;
        let seed = |offset: usize| config.seed.map(|s| s.wrapping_add(offset as u64));
        let mut cycler = BatchCycler::new(device.clone());

        for (i, name) in config.source_names.iter().enumerate() {
            let dataset = provider.source(name)?;
            log::info!("source set {} length {}.", name, dataset.len());
            dataset.summary();
            cycler.insert(
                Stream::Source(i),
                DomainLoader::new(dataset, config.batch_size, true, seed(i)),
            );
        }

        let (train, val) = provider.target(&config.target_name)?;
        log::info!(
            "training set length {}, validation set length {}.",
            train.len(),
            val.len()
        );
        train.summary();
        val.summary();
        cycler.insert(
            Stream::Target,
            DomainLoader::new(train, config.batch_size, true, seed(config.source_names.len())),
        );
        cycler.insert(Stream::Validation, DomainLoader::new(val, config.batch_size, false, None));

        let context = Self {
            config: config.clone(),
            device,
            cycler,
            source_names: config.source_names.clone(),
        };
        for stream in context.streams() {
            if context.cycler.num_batches(stream)? == 0 {
                return Err(crate::DaError::Training(format!(
                    "stream {} holds fewer samples than one batch of {}",
                    stream, config.batch_size
                )));
            }
        }

        Ok(context)
    }

    pub fn num_sources(&self) -> usize {
        self.source_names.len()
    }

    /// Every stream of the run: sources, then target train and validation
    pub fn streams(&self) -> Vec<Stream> {
        let mut streams: Vec<Stream> = (0..self.num_sources()).map(Stream::Source).collect();
        streams.push(Stream::Target);
        streams.push(Stream::Validation);
        streams
    }

    /// Mean batch accuracy over one full pass of the validation stream
    pub fn evaluate<F>(&mut self, mut predict: F) -> crate::Result<f64>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        let iterations = self.cycler.num_batches(Stream::Validation)?;
        let mut acc = 0.0;
        for _ in 0..iterations {
            let batch = self.cycler.next(Stream::Validation)?;
            let pred = predict(&batch.inputs)?;
            acc += accuracy(&pred, &batch.labels)?;
        }
        Ok(acc / iterations.max(1) as f64)
    }

    /// Save every network when `epoch` closes a `save_step` interval
    pub fn checkpoint(&self, epoch: usize, networks: &[(&str, &VarMap)], lr: f64, val_acc: f64) -> crate::Result<()> {
        let save_step = self.config.save_step;
        if save_step == 0 || (epoch + 1) % save_step != 0 {
            return Ok(());
        }
        save_networks(&self.config.checkpoint_dir, networks, epoch, lr, val_acc)?;
        Ok(())
    }
}

/// Run the trainer selected by `config.model_name` for `max_epoch + 1` epochs
pub fn run(config: &TrainConfig, provider: &dyn DatasetProvider) -> crate::Result<TrainingReport> {
    let kind = TrainerKind::from_model_name(&config.model_name)?;
    if let TrainerKind::SingleSource(_) = kind {
        if config.source_names.len() != 1 {
            return Err(crate::DaError::Configuration(format!(
                "model {} trains on exactly one source, got {}",
                config.model_name,
                config.source_names.len()
            )));
        }
    }

    let mut ctx = TrainingContext::new(config, provider)?;
    log::info!(
        "Training {} ({:?}) on {:?} -> {} using {:?}",
        config.model_name,
        kind,
        ctx.source_names,
        config.target_name,
        ctx.device
    );

    let report = match kind {
        TrainerKind::SingleSource(group) => SingleSourceTrainer::new(group, &ctx)?.train(&mut ctx)?,
        TrainerKind::MultiSourceAdversarial => MstlnTrainer::new(&ctx)?.train(&mut ctx)?,
        TrainerKind::MixtureOfExperts => ManMoeTrainer::new(&ctx)?.train(&mut ctx)?,
    };

    log::info!(
        "Training complete! best val-acc {:.4} at epoch {}",
        report.best.acc,
        report.best.epoch
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::testing::synthetic_provider;
    use crate::DaError;

    /// Small, fast configuration over the synthetic provider
    pub(crate) fn test_config(model_name: &str, sources: &[&str]) -> TrainConfig {
        TrainConfig {
            model_name: model_name.to_string(),
            source_names: sources.iter().map(|s| s.to_string()).collect(),
            target_name: "T".to_string(),
            batch_size: 4,
            num_classes: 3,
            opt: "adam".to_string(),
            lr: 1e-3,
            lr_scheduler: "fix".to_string(),
            max_epoch: 1,
            feature_dim: 16,
            mstln_iterations: 2,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_trainer_kind() {
        assert_eq!(
            TrainerKind::from_model_name("MSTLN").unwrap(),
            TrainerKind::MultiSourceAdversarial
        );
        assert_eq!(
            TrainerKind::from_model_name("Man_Moe").unwrap(),
            TrainerKind::MixtureOfExperts
        );
        assert_eq!(
            TrainerKind::from_model_name("DANN").unwrap(),
            TrainerKind::SingleSource(ModelGroup::Adversarial)
        );
        assert!(TrainerKind::from_model_name("ResNet").is_err());
    }

    #[test]
    fn test_explicit_device_still_validates() {
        let provider = synthetic_provider(&["A"], "T", 3);
        let config = TrainConfig {
            tradeoff: vec![0.1, 0.1],
            ..test_config("CNN", &["A"])
        };
        let result = TrainingContext::with_device(&config, &provider, Device::Cpu);
        assert!(matches!(result, Err(DaError::Configuration(_))));
    }

    #[test]
    fn test_context_wires_every_stream() -> crate::Result<()> {
        let provider = synthetic_provider(&["A", "B"], "T", 3);
        let ctx = TrainingContext::new(&test_config("MSTLN", &["A", "B"]), &provider)?;

        assert_eq!(ctx.streams().len(), 4);
        // 18 samples per source and target train, 9 for validation, batches of 4
        assert_eq!(ctx.cycler.num_batches(Stream::Source(1))?, 4);
        assert_eq!(ctx.cycler.num_batches(Stream::Target)?, 4);
        assert_eq!(ctx.cycler.num_batches(Stream::Validation)?, 2);
        Ok(())
    }

    #[test]
    fn test_unknown_domain() {
        let provider = synthetic_provider(&["A"], "T", 3);
        let result = TrainingContext::new(&test_config("CNN", &["missing"]), &provider);
        assert!(matches!(result, Err(DaError::DomainLookup(_))));
    }

    #[test]
    fn test_batch_larger_than_validation_split() {
        let provider = synthetic_provider(&["A"], "T", 3);
        let config = TrainConfig {
            batch_size: 12,
            ..test_config("CNN", &["A"])
        };
        assert!(matches!(
            TrainingContext::new(&config, &provider),
            Err(DaError::Training(_))
        ));
    }

    #[test]
    fn test_single_source_rejects_several_sources() {
        let provider = synthetic_provider(&["A", "B"], "T", 3);
        let result = run(&test_config("WDCNN", &["A", "B"]), &provider);
        assert!(matches!(result, Err(DaError::Configuration(_))));
    }

    #[test]
    fn test_unknown_model_name() {
        let provider = synthetic_provider(&["A"], "T", 3);
        let result = run(&test_config("ResNet", &["A"]), &provider);
        assert!(matches!(result, Err(DaError::Configuration(_))));
    }

    #[test]
    fn test_periodic_checkpoints() -> crate::Result<()> {
        let dir = std::env::temp_dir().join(format!("msda_run_{}", std::process::id()));
        let provider = synthetic_provider(&["A"], "T", 3);
        let config = TrainConfig {
            save_step: 1,
            checkpoint_dir: dir.to_string_lossy().into_owned(),
            ..test_config("CNN", &["A"])
        };

        run(&config, &provider)?;
        assert!(dir.join("0_classifier.safetensors").exists());
        assert!(dir.join("1_classifier.safetensors").exists());

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
