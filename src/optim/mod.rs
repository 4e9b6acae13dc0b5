pub mod adam;
pub mod optimizer;
pub mod scheduler;
pub mod sgd;

pub use adam::Adam;
pub use optimizer::{Optimizer, OptimizerConfig, OptimizerKind};
pub use scheduler::{LearningRateScheduler, ReduceOnPlateau, SchedulerConfig, SchedulerKind, StepLr};
pub use sgd::Sgd;
