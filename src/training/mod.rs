/// Training infrastructure: optimizers, schedules, bookkeeping and the
/// three domain adaptation trainers
pub mod checkpoint;
pub mod context;
pub mod man_moe;
pub mod metrics;
pub mod mstln;
pub mod optimizer;
pub mod scheduler;
pub mod single_source;

pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use context::{run, TrainerKind, TrainingContext};
pub use man_moe::ManMoeTrainer;
pub use metrics::{BestAccuracy, EpochMetrics, EpochReport, TrainingReport};
pub use mstln::MstlnTrainer;
pub use optimizer::{build_optimizer, DomainOptimizer, OptimizerKind};
pub use scheduler::{build_schedule, LrScheduler, ScheduleKind};
pub use single_source::SingleSourceTrainer;
