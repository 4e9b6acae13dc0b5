pub mod math;
pub mod activation;
pub mod layers;
pub mod loss;
pub mod model;
pub mod metrics;
pub mod optim;
pub mod data;
pub mod error;
pub mod train;

// Convenience re-exports
pub use math::{Matrix, Parameter, StateDict};
pub use activation::ActivationFunction;
pub use model::{Mode, Model, ModelInput, ModelOutput, TextCnn, TextCnnConfig};
pub use loss::{LossGraph, LossKind, ScalarLoss};
pub use metrics::{EpochMetrics, Metric, MetricKind};
pub use optim::{Optimizer, OptimizerConfig, LearningRateScheduler, SchedulerConfig};
pub use data::{Batch, BatchIterator, Example, Fields, InMemoryIterator, Vocabulary};
pub use error::{CheckpointError, ConfigError, ExecutionError, ModelError, TrainError};
pub use train::{Checkpointer, MetricTracker, Trainer, TrainerConfig};
