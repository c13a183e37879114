/// Mixture-of-experts multi-source trainer (MAN-MoE)
use candle_core::{DType, ModuleT, Tensor};
use candle_nn::loss;

use super::context::TrainingContext;
use super::metrics::{format_metrics, BestAccuracy, EpochMetrics, EpochReport, TrainingReport};
use super::optimizer::{build_optimizer, DomainOptimizer};
use crate::data::Stream;
use crate::losses::gate_label;
use crate::models::ManMoeNets;
use crate::utils::{count_correct, gmean, percent, scalar_value};

/// Training counters of one epoch, per source where indexed
#[derive(Debug, Default)]
struct EpochCounts {
    d_correct: usize,
    d_total: usize,
    correct: Vec<usize>,
    gate_correct: Vec<usize>,
    c_gate_correct: Vec<usize>,
    total: Vec<usize>,
}

impl EpochCounts {
    fn new(num_sources: usize) -> Self {
        Self {
            correct: vec![0; num_sources],
            gate_correct: vec![0; num_sources],
            c_gate_correct: vec![0; num_sources],
            total: vec![0; num_sources],
            ..Default::default()
        }
    }
}

fn percent_row(hits: &[usize], totals: &[usize]) -> String {
    hits.iter()
        .zip(totals)
        .map(|(h, t)| format!("{:.3}", percent(*h, *t)))
        .collect::<Vec<_>>()
        .join("\t")
}

pub struct ManMoeTrainer {
    nets: ManMoeNets,
    optimizer: DomainOptimizer,
    optimizer_d: DomainOptimizer,
    num_sources: usize,
    iterations: usize,
    tradeoff: Vec<f64>,
}

impl ManMoeTrainer {
    pub fn new(ctx: &TrainingContext) -> crate::Result<Self> {
        let config = &ctx.config;
        let num_sources = ctx.num_sources();
        let nets = ManMoeNets::new(num_sources, config.num_classes, config.dropout, &ctx.device)?;

        let optimizer = build_optimizer(nets.generator_vars(), config)?;
        let optimizer_d = build_optimizer(nets.discriminator.vars(), config)?;

        // Geometric mean of batches per pass over the sources and the target
        let mut counts = (0..num_sources)
            .map(|i| ctx.cycler.num_batches(Stream::Source(i)))
            .collect::<crate::Result<Vec<_>>>()?;
        counts.push(ctx.cycler.num_batches(Stream::Target)?);
        let iterations = (gmean(&counts) + 1e-9).floor() as usize;

        log::info!(
            "Built MAN-MoE over {} sources, {} iterations per epoch",
            num_sources,
            iterations
        );

        Ok(Self {
            nets,
            optimizer,
            optimizer_d,
            num_sources,
            iterations,
            tradeoff: config.tradeoff.clone(),
        })
    }

    /// Sources are domains `0..S`, the target is domain `S`
    fn domain_stream(&self, idx: usize) -> Stream {
        if idx < self.num_sources {
            Stream::Source(idx)
        } else {
            Stream::Target
        }
    }

    fn train_iteration(
        &mut self,
        ctx: &mut TrainingContext,
        counts: &mut EpochCounts,
        metrics: &mut EpochMetrics,
    ) -> crate::Result<()> {
        let t = &self.tradeoff;

        // Discriminator phase: shared features are frozen
        let mut d_loss = Tensor::zeros((), DType::F32, &ctx.device)?;
        for idx in 0..=self.num_sources {
            let batch = ctx.cycler.next(self.domain_stream(idx))?;
            let shared = self.nets.shared.forward_t(&batch.inputs, true)?.detach();
            let d_outputs = self.nets.discriminate(&shared)?;
            let d_targets = gate_label(&d_outputs, idx)?;

            counts.d_correct += count_correct(&d_outputs, &d_targets)?;
            counts.d_total += d_targets.dim(0)?;
            d_loss = (d_loss + loss::nll(&d_outputs, &d_targets)?)?;
        }
        self.optimizer_d.backward_step(&d_loss)?;
        metrics.add("d_loss", scalar_value(&d_loss)?);

        // Generator phase: classification and gate supervision per source
        let mut g_loss = Tensor::zeros((), DType::F32, &ctx.device)?;
        for idx in 0..self.num_sources {
            let batch = ctx.cycler.next(Stream::Source(idx))?;
            let shared = self.nets.shared.forward_t(&batch.inputs, true)?;
            let (private, gate_outputs) = self.nets.private.forward_t(&batch.inputs, true)?;
            let (c_outputs, c_gate_outputs) = self.nets.classifier.forward(&shared, &private)?;

            let gate_targets = gate_label(&gate_outputs, idx)?;
            let gate_loss = loss::cross_entropy(&gate_outputs, &gate_targets)?;
            let c_gate_loss = loss::cross_entropy(&c_gate_outputs, &gate_targets)?;
            let clf_loss = loss::nll(&c_outputs, &batch.labels)?;

            counts.gate_correct[idx] += count_correct(&gate_outputs, &gate_targets)?;
            counts.c_gate_correct[idx] += count_correct(&c_gate_outputs, &gate_targets)?;
            counts.correct[idx] += count_correct(&c_outputs, &batch.labels)?;
            counts.total[idx] += batch.labels.dim(0)?;
            metrics.add("clf", scalar_value(&clf_loss)?);
            metrics.add("gate", scalar_value(&gate_loss)?);
            metrics.add("c_gate", scalar_value(&c_gate_loss)?);

            let loss = ((clf_loss + (gate_loss * t[0])?)? + (c_gate_loss * t[1])?)?;
            g_loss = (g_loss + loss)?;
        }

        // Adversarial phase: push shared features towards domain confusion
        for idx in 0..=self.num_sources {
            let batch = ctx.cycler.next(self.domain_stream(idx))?;
            let shared = self.nets.shared.forward_t(&batch.inputs, true)?;
            let d_outputs = self.nets.discriminate(&shared)?;
            let d_targets = gate_label(&d_outputs, idx)?;
            let adv_loss = (loss::nll(&d_outputs, &d_targets)? * -t[2])?;
            metrics.add("adv", scalar_value(&adv_loss)?);
            g_loss = (g_loss + adv_loss)?;
        }

        // Only shared, private and classifier vars are stepped
        self.optimizer.backward_step(&g_loss)?;
        Ok(())
    }

    pub fn train(&mut self, ctx: &mut TrainingContext) -> crate::Result<TrainingReport> {
        let max_epoch = ctx.config.max_epoch;
        let mut best = BestAccuracy::default();
        let mut report = TrainingReport::default();
        let mut metrics = EpochMetrics::new();

        for epoch in 0..=max_epoch {
            metrics.reset();
            let mut counts = EpochCounts::new(self.num_sources);
            for _ in 0..self.iterations {
                self.train_iteration(ctx, &mut counts, &mut metrics)?;
            }
            let mut losses = metrics.finalize(self.iterations);

            log::info!("Ending epoch {}", epoch);
            log::info!("D Training Accuracy: {:.3}", percent(counts.d_correct, counts.d_total));
            log::info!("Training accuracy:");
            log::info!("{}", ctx.source_names.join("\t"));
            log::info!("{}", percent_row(&counts.correct, &counts.total));
            log::info!("Gate accuracy:");
            log::info!("{}", percent_row(&counts.gate_correct, &counts.total));
            log::info!("Tagger Gate accuracy:");
            log::info!("{}", percent_row(&counts.c_gate_correct, &counts.total));
            log::debug!("train-{}", format_metrics(&losses));

            log::info!("Evaluating validation sets:");
            let nets = &self.nets;
            let val_acc = ctx.evaluate(|xs| nets.predict(xs))?;
            log::info!("Average validation accuracy: {:.3}", 100.0 * val_acc);

            best.observe(epoch, val_acc);
            log::info!("Best epoch {} accuracy: {:.3}", best.epoch, 100.0 * best.acc);

            ctx.checkpoint(
                epoch,
                &[
                    (self.nets.shared.name(), self.nets.shared.varmap()),
                    (self.nets.private.name(), self.nets.private.varmap()),
                    (self.nets.classifier.name(), self.nets.classifier.varmap()),
                    (self.nets.discriminator.name(), self.nets.discriminator.varmap()),
                ],
                self.optimizer.learning_rate(),
                val_acc,
            )?;

            let trained: usize = counts.total.iter().sum();
            losses.insert("d_acc".to_string(), percent(counts.d_correct, counts.d_total) / 100.0);
            report.epochs.push(EpochReport {
                epoch,
                train_acc: counts.correct.iter().sum::<usize>() as f64 / trained.max(1) as f64,
                val_acc,
                losses,
                pairs_per_iteration: None,
            });
        }

        log::info!("Best average validation accuracy: {:.3}", 100.0 * best.acc);
        report.best = best;
        report.generator_steps = self.optimizer.steps();
        report.discriminator_steps = self.optimizer_d.steps();
        Ok(report)
    }
}
