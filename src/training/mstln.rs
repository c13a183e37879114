/// Multi-source adversarial trainer (MSTLN)
///
/// A shared extractor with one open-set head per source is trained against
/// one Wasserstein critic per source. Every iteration interleaves generator
/// and critic steps source by source, then takes one generator step on the
/// combined classification, alignment, entropy and cross-source terms.
use candle_core::{DType, Tensor, D};
use candle_nn::{loss, ops};

use super::context::TrainingContext;
use super::metrics::{format_metrics, BestAccuracy, EpochMetrics, EpochReport, TrainingReport};
use super::optimizer::{build_optimizer, DomainOptimizer};
use super::scheduler::{build_schedule, LrScheduler};
use crate::data::Stream;
use crate::layers::MlpCritic;
use crate::losses::{
    entropy_shared_private_loss, mmd, pairwise_mmd, safe_log, unknown_class_loss, wasserstein_critic_loss,
};
use crate::models::mstln::build_critics;
use crate::models::{MstlnNet, Network};
use crate::utils::{count_correct, percent, scalar_value};

pub struct MstlnTrainer {
    model: Network<MstlnNet>,
    critics: Network<Vec<MlpCritic>>,
    optimizer: DomainOptimizer,
    optimizer_d: DomainOptimizer,
    scheduler: Option<LrScheduler>,
    iterations: usize,
}

impl MstlnTrainer {
    pub fn new(ctx: &TrainingContext) -> crate::Result<Self> {
        let config = &ctx.config;
        let num_sources = ctx.num_sources();

        let model = Network::build("mstln", &ctx.device, |vb| {
            MstlnNet::new(1, config.num_classes, num_sources, config.feature_dim, vb)
        })?;
        let critics = build_critics(num_sources, config.feature_dim, &ctx.device)?;

        let optimizer = build_optimizer(model.vars(), config)?;
        let optimizer_d = build_optimizer(critics.vars(), config)?;
        let scheduler = build_schedule(&optimizer, config)?;

        log::info!(
            "Built MSTLN with {} heads ({} parameters) and {} critics ({} parameters)",
            num_sources,
            model.num_parameters(),
            critics.len(),
            critics.num_parameters()
        );

        Ok(Self {
            model,
            critics,
            optimizer,
            optimizer_d,
            scheduler,
            iterations: config.mstln_iterations,
        })
    }

    /// One outer iteration; returns the number of aligned source pairs
    fn train_iteration(
        &mut self,
        ctx: &mut TrainingContext,
        correct: &mut [usize],
        total: &mut [usize],
        metrics: &mut EpochMetrics,
    ) -> crate::Result<usize> {
        let target = ctx.cycler.next(Stream::Target)?;
        let num_sources = self.model.num_sources();

        let zero = Tensor::zeros((), DType::F32, &ctx.device)?;
        let mut clf_loss = zero.clone();
        let mut align_loss = zero.clone();
        let mut entropy_loss = zero;
        let mut tgt_feats = Vec::with_capacity(num_sources);

        for idx in 0..num_sources {
            let source = ctx.cycler.next(Stream::Source(idx))?;

            let (src_feat, src_probs) = self.model.forward(&source.inputs, idx)?;
            let (tgt_feat, tgt_probs) = self.model.forward(&target.inputs, idx)?;

            correct[idx] += count_correct(&tgt_probs, &target.labels)?;
            total[idx] += target.labels.dim(0)?;

            clf_loss = (clf_loss + loss::nll(&safe_log(&src_probs)?, &source.labels)?)?;

            // Last column is the unknown class
            let known_classes = tgt_probs.dim(1)? - 1;
            let unknown = tgt_probs.narrow(1, known_classes, 1)?.squeeze(1)?;
            let known = tgt_probs.narrow(1, 0, known_classes)?;

            let unknown_loss = unknown_class_loss(&unknown)?;
            self.optimizer.backward_step(&unknown_loss)?;
            metrics.add("unknown", scalar_value(&unknown_loss)?);

            let known_weight = unknown.affine(-1.0, 1.0)?;
            entropy_loss = (entropy_loss + entropy_shared_private_loss(&known_weight, &known)?)?;

            // The critic only sees detached features
            let (critic_loss, tgt_scores) =
                wasserstein_critic_loss(&self.critics[idx], &src_feat.detach(), &tgt_feat.detach())?;
            self.optimizer_d.backward_step(&critic_loss)?;
            metrics.add("critic", scalar_value(&critic_loss)?);

            // Class-balance factors (1 - p_unk) * softmax(D(tgt)), normalized by their mean
            let balance = known_weight
                .unsqueeze(1)?
                .broadcast_mul(&ops::softmax(&tgt_scores.detach(), D::Minus1)?)?;
            let balance = balance.broadcast_div(&balance.mean_all()?)?;
            align_loss = (align_loss + mmd(&src_feat, &tgt_feat, Some(&balance))?)?;

            tgt_feats.push(tgt_feat);
        }

        let (cross_loss, pairs) = pairwise_mmd(&tgt_feats)?;
        let total_loss = (((&clf_loss + &align_loss)? + &entropy_loss)? + &cross_loss)?;
        self.optimizer.backward_step(&total_loss)?;

        metrics.add("clf", scalar_value(&clf_loss)?);
        metrics.add("mmd", scalar_value(&align_loss)?);
        metrics.add("entropy", scalar_value(&entropy_loss)?);
        metrics.add("cross_mmd", scalar_value(&cross_loss)?);
        log::debug!("total loss {:.4} over {} source pairs", scalar_value(&total_loss)?, pairs);

        Ok(pairs)
    }

    pub fn train(&mut self, ctx: &mut TrainingContext) -> crate::Result<TrainingReport> {
        let max_epoch = ctx.config.max_epoch;
        let num_sources = ctx.num_sources();
        let mut best = BestAccuracy::default();
        let mut report = TrainingReport::default();
        let mut metrics = EpochMetrics::new();

        for epoch in 0..=max_epoch {
            log::info!("-----Epoch {}/{}-----", epoch, max_epoch);
            if self.scheduler.is_some() {
                log::info!("current lr: {}", self.optimizer.learning_rate());
            }

            metrics.reset();
            let mut correct = vec![0; num_sources];
            let mut total = vec![0; num_sources];
            let mut pairs = 0;
            for _ in 0..self.iterations {
                pairs = self.train_iteration(ctx, &mut correct, &mut total, &mut metrics)?;
            }
            let losses = metrics.finalize(self.iterations);

            log::info!("Ending epoch {}", epoch);
            log::info!("Training accuracy:");
            log::info!("{}", ctx.source_names.join("\t"));
            log::info!(
                "{}",
                correct
                    .iter()
                    .zip(&total)
                    .map(|(c, t)| format!("{:.3}", percent(*c, *t)))
                    .collect::<Vec<_>>()
                    .join("\t")
            );
            log::info!("train-{}", format_metrics(&losses));

            let model = &self.model;
            let val_acc = ctx.evaluate(|xs| model.predict(xs))?;
            if best.observe(epoch, val_acc) {
                log::info!("The best model epoch {}, val-acc {:.4}", best.epoch, best.acc);
            }

            ctx.checkpoint(
                epoch,
                &[
                    (self.model.name(), self.model.varmap()),
                    (self.critics.name(), self.critics.varmap()),
                ],
                self.optimizer.learning_rate(),
                val_acc,
            )?;

            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step(&mut self.optimizer);
            }

            report.epochs.push(EpochReport {
                epoch,
                train_acc: correct.iter().sum::<usize>() as f64 / total.iter().sum::<usize>().max(1) as f64,
                val_acc,
                losses,
                pairs_per_iteration: Some(pairs),
            });
        }

        report.best = best;
        report.generator_steps = self.optimizer.steps();
        report.discriminator_steps = self.optimizer_d.steps();
        Ok(report)
    }
}
