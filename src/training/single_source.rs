/// Single-source trainer for training modes 0-3
///
/// Mode 0 fits a plain classifier on the source. Modes 1-3 add the
/// adaptation terms their networks return, weighted by the tradeoff
/// coefficients, and score predictions against the target labels.
use candle_core::Tensor;

use super::context::TrainingContext;
use super::metrics::{format_metrics, BestAccuracy, EpochMetrics, EpochReport, TrainingReport};
use super::optimizer::{build_optimizer, DomainOptimizer};
use super::scheduler::{build_schedule, LrScheduler};
use crate::data::Stream;
use crate::models::{ModelGroup, SingleSourceModel};
use crate::utils::{accuracy, scalar_value};

/// Output of one training iteration
struct StepOutput {
    pred: Tensor,
    labels: Tensor,
    loss: Tensor,
    components: Vec<Tensor>,
}

pub struct SingleSourceTrainer {
    model: SingleSourceModel,
    optimizer: DomainOptimizer,
    scheduler: Option<LrScheduler>,
    tradeoff: Vec<f64>,
}

impl SingleSourceTrainer {
    pub fn new(group: ModelGroup, ctx: &TrainingContext) -> crate::Result<Self> {
        if ctx.num_sources() != 1 {
            return Err(crate::DaError::Configuration(format!(
                "training mode {} expects exactly one source, got {}",
                group.training_mode(),
                ctx.num_sources()
            )));
        }

        let model = SingleSourceModel::build(group, ctx.config.num_classes, &ctx.device)?;
        let optimizer = build_optimizer(model.vars(), &ctx.config)?;
        let scheduler = build_schedule(&optimizer, &ctx.config)?;

        log::info!(
            "Built {} network for training mode {} ({} parameter tensors)",
            model.name(),
            group.training_mode(),
            optimizer.num_vars()
        );

        Ok(Self {
            model,
            optimizer,
            scheduler,
            tradeoff: ctx.config.tradeoff.clone(),
        })
    }

    fn train_step(&mut self, ctx: &mut TrainingContext) -> crate::Result<StepOutput> {
        let source = ctx.cycler.next(Stream::Source(0))?;
        let t = &self.tradeoff;

        let output = match &self.model {
            SingleSourceModel::Plain(net) => {
                let (pred, loss) = net.forward(&source.inputs, &source.labels)?;
                StepOutput {
                    pred,
                    labels: source.labels,
                    components: vec![loss.clone()],
                    loss,
                }
            }
            SingleSourceModel::Alignment(net) => {
                let target = ctx.cycler.next(Stream::Target)?;
                let (pred, l0, l1) = net.forward(&target.inputs, &source.inputs, &source.labels)?;
                StepOutput {
                    pred,
                    labels: target.labels,
                    loss: (&l0 + (&l1 * t[0])?)?,
                    components: vec![l0, l1],
                }
            }
            SingleSourceModel::Discrepancy(net) => {
                let target = ctx.cycler.next(Stream::Target)?;
                let (pred, l0, l1, l2) = net.forward(&target.inputs, &source.inputs, &source.labels, 0)?;
                StepOutput {
                    pred,
                    labels: target.labels,
                    loss: ((&l0 + (&l1 * t[0])?)? + (&l2 * t[1])?)?,
                    components: vec![l0, l1, l2],
                }
            }
            SingleSourceModel::MultiSource(net) => {
                let target = ctx.cycler.next(Stream::Target)?;
                let (pred, l0, l1) = net.forward(
                    &target.inputs,
                    std::slice::from_ref(&source.inputs),
                    std::slice::from_ref(&source.labels),
                    true,
                )?;
                StepOutput {
                    pred,
                    labels: target.labels,
                    loss: (&l0 + (&l1 * t[0])?)?,
                    components: vec![l0, l1],
                }
            }
        };

        self.optimizer.backward_step(&output.loss)?;
        Ok(output)
    }

    /// Validation predictions for one batch; mode 3 also draws a source batch
    fn val_step(&self, ctx: &mut TrainingContext) -> crate::Result<f64> {
        let (pred, labels) = match &self.model {
            SingleSourceModel::MultiSource(net) => {
                let source = ctx.cycler.next(Stream::Source(0))?;
                let target = ctx.cycler.next(Stream::Validation)?;
                let (pred, _, _) = net.forward(
                    &target.inputs,
                    std::slice::from_ref(&source.inputs),
                    std::slice::from_ref(&source.labels),
                    false,
                )?;
                (pred, target.labels)
            }
            SingleSourceModel::Plain(net) => {
                let target = ctx.cycler.next(Stream::Validation)?;
                (net.predict(&target.inputs)?, target.labels)
            }
            SingleSourceModel::Alignment(net) => {
                let target = ctx.cycler.next(Stream::Validation)?;
                (net.predict(&target.inputs)?, target.labels)
            }
            SingleSourceModel::Discrepancy(net) => {
                let target = ctx.cycler.next(Stream::Validation)?;
                (net.predict(&target.inputs)?, target.labels)
            }
        };
        Ok(accuracy(&pred, &labels)?)
    }

    pub fn train(&mut self, ctx: &mut TrainingContext) -> crate::Result<TrainingReport> {
        let max_epoch = ctx.config.max_epoch;
        let mut best = BestAccuracy::default();
        let mut report = TrainingReport::default();
        let mut metrics = EpochMetrics::new();

        for epoch in 0..=max_epoch {
            log::info!("-----Epoch {}/{}-----", epoch, max_epoch);
            if self.scheduler.is_some() {
                log::info!("current lr: {}", self.optimizer.learning_rate());
            }

            // Train phase
            metrics.reset();
            let train_iters = ctx.cycler.num_batches(Stream::Target)?;
            let mut train_acc = 0.0;
            for i in 0..train_iters {
                let output = self.train_step(ctx)?;
                train_acc += accuracy(&output.pred, &output.labels)?;
                for (k, component) in output.components.iter().enumerate() {
                    metrics.add(&format!("loss_{}", k), scalar_value(component)?);
                }
                log::debug!("iteration {}/{}: loss {:.4}", i + 1, train_iters, scalar_value(&output.loss)?);
            }
            let train_acc = train_acc / train_iters.max(1) as f64;
            let losses = metrics.finalize(train_iters);
            log::info!("train-{}", format_metrics(&losses));
            log::info!("train-Acc: {:.4}", train_acc);

            // Val phase
            let val_iters = ctx.cycler.num_batches(Stream::Validation)?;
            let mut val_acc = 0.0;
            for _ in 0..val_iters {
                val_acc += self.val_step(ctx)?;
            }
            let val_acc = val_acc / val_iters.max(1) as f64;
            log::info!("val-Acc: {:.4}", val_acc);

            best.observe(epoch, val_acc);
            log::info!("The best model epoch {}, val-acc {:.4}", best.epoch, best.acc);

            ctx.checkpoint(
                epoch,
                &[(self.model.name(), self.model.varmap())],
                self.optimizer.learning_rate(),
                val_acc,
            )?;

            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step(&mut self.optimizer);
            }

            report.epochs.push(EpochReport {
                epoch,
                train_acc,
                val_acc,
                losses,
                pairs_per_iteration: None,
            });
        }

        report.best = best;
        report.generator_steps = self.optimizer.steps();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::synthetic_provider;
    use crate::training::context::tests::test_config;
    use crate::TrainConfig;

    fn run_mode(model_name: &str) -> crate::Result<TrainingReport> {
        let provider = synthetic_provider(&["A"], "T", 3);
        let config = test_config(model_name, &["A"]);
        let mut ctx = TrainingContext::new(&config, &provider)?;
        let group = ModelGroup::from_model_name(model_name)?;
        SingleSourceTrainer::new(group, &ctx)?.train(&mut ctx)
    }

    #[test]
    fn test_plain_mode_single_epoch_scenario() -> crate::Result<()> {
        let report = run_mode("CNN")?;

        // max_epoch 1 runs two epochs of four target-train batches each
        assert_eq!(report.epochs.len(), 2);
        assert_eq!(report.generator_steps, 2 * 4);
        assert_eq!(report.discriminator_steps, 0);

        let best_val = report.epochs.iter().map(|e| e.val_acc).fold(0.0, f64::max);
        assert_eq!(report.best.acc > 0.0, best_val > 0.0);
        assert_eq!(report.best.acc, best_val);
        assert!(report.epochs.iter().all(|e| e.losses.contains_key("loss_0")));
        Ok(())
    }

    #[test]
    fn test_every_mode_records_its_loss_terms() -> crate::Result<()> {
        for (name, terms) in [("DAN", 2), ("MFSAN", 3), ("MSSA", 2)] {
            let report = run_mode(name)?;
            let last = report.last_epoch().expect("epochs recorded");
            assert_eq!(last.losses.len(), terms, "{}", name);
            assert_eq!(report.generator_steps, 8, "{}", name);
            assert!((0.0..=1.0).contains(&last.val_acc));
        }
        Ok(())
    }

    #[test]
    fn test_schedule_decays_learning_rate() -> crate::Result<()> {
        let provider = synthetic_provider(&["A"], "T", 3);
        let config = TrainConfig {
            lr_scheduler: "exp".to_string(),
            gamma: 0.5,
            ..test_config("CNN", &["A"])
        };
        let mut ctx = TrainingContext::new(&config, &provider)?;
        let mut trainer = SingleSourceTrainer::new(ModelGroup::Plain, &ctx)?;
        trainer.train(&mut ctx)?;

        // Two epochs, two decays
        assert!((trainer.optimizer.learning_rate() - 1e-3 * 0.25).abs() < 1e-12);
        Ok(())
    }
}
