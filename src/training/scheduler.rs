/// Epoch-based learning rate decay schedules
use super::optimizer::DomainOptimizer;
use crate::TrainConfig;

/// Decay rule of a learning rate schedule
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleKind {
    /// Multiply by `gamma` at every milestone epoch
    MultiStep { milestones: Vec<usize>, gamma: f64 },
    /// Multiply by `gamma` every epoch
    Exponential { gamma: f64 },
    /// Multiply by `gamma` every `step_size` epochs
    Step { step_size: usize, gamma: f64 },
}

impl ScheduleKind {
    /// Parse a schedule name; `"fix"` keeps the rate constant and yields `None`
    pub fn parse(name: &str, steps: &str, gamma: f64) -> crate::Result<Option<Self>> {
        match name {
            "step" => {
                let milestones = steps
                    .split(',')
                    .map(|s| parse_epoch(s))
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(Some(Self::MultiStep { milestones, gamma }))
            }
            "exp" => Ok(Some(Self::Exponential { gamma })),
            "stepLR" => {
                let step_size = parse_epoch(steps)?;
                if step_size == 0 {
                    return Err(crate::DaError::Configuration(
                        "stepLR interval must be at least one epoch".to_string(),
                    ));
                }
                Ok(Some(Self::Step { step_size, gamma }))
            }
            "fix" => Ok(None),
            other => Err(crate::DaError::Configuration(format!(
                "lr schedule not implemented: {}",
                other
            ))),
        }
    }
}

fn parse_epoch(s: &str) -> crate::Result<usize> {
    s.trim()
        .parse()
        .map_err(|_| crate::DaError::Configuration(format!("Invalid epoch in steps: '{}'", s)))
}

/// Learning rate scheduler stepped once per epoch
pub struct LrScheduler {
    kind: ScheduleKind,
    base_lr: f64,
    epoch: usize,
}

impl LrScheduler {
    pub fn new(kind: ScheduleKind, base_lr: f64) -> Self {
        Self {
            kind,
            base_lr,
            epoch: 0,
        }
    }

    /// Learning rate after `epoch` completed epochs
    pub fn get_lr_at_epoch(&self, epoch: usize) -> f64 {
        let decays = match &self.kind {
            ScheduleKind::MultiStep { milestones, .. } => milestones.iter().filter(|&&m| m <= epoch).count(),
            ScheduleKind::Exponential { .. } => epoch,
            ScheduleKind::Step { step_size, .. } => epoch / step_size,
        };
        let gamma = match &self.kind {
            ScheduleKind::MultiStep { gamma, .. }
            | ScheduleKind::Exponential { gamma }
            | ScheduleKind::Step { gamma, .. } => *gamma,
        };
        self.base_lr * gamma.powi(decays as i32)
    }

    pub fn current_lr(&self) -> f64 {
        self.get_lr_at_epoch(self.epoch)
    }

    /// Close one epoch and return the new learning rate
    pub fn advance(&mut self) -> f64 {
        self.epoch += 1;
        self.current_lr()
    }

    /// Advance and push the new rate into `optimizer`
    pub fn step(&mut self, optimizer: &mut DomainOptimizer) {
        let lr = self.advance();
        optimizer.set_learning_rate(lr);
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Schedule for `optimizer` as configured, `None` for a fixed rate
pub fn build_schedule(optimizer: &DomainOptimizer, config: &TrainConfig) -> crate::Result<Option<LrScheduler>> {
    Ok(config
        .schedule_kind()?
        .map(|kind| LrScheduler::new(kind, optimizer.learning_rate())))
}
