pub mod checkpointer;
pub mod execution;
pub mod gradient;
pub mod mask;
pub mod metric_tracker;
pub mod metrics_io;
pub mod resource;
pub mod telemetry;
pub mod train_config;
pub mod trainer;
pub mod training_state;

pub use checkpointer::Checkpointer;
pub use execution::{ExecutionConfig, ExecutionStrategy, LossScalerState, MixedPrecisionConfig, StepOutcome};
pub use gradient::{enable_gradient_clipping, rescale_gradients, GradientController};
pub use mask::{generate_mask, padding_mask};
pub use metric_tracker::{MetricTracker, MetricTrackerState};
pub use metrics_io::{dump_info, dump_metrics, MetricsRecord};
pub use telemetry::{JsonLinesSink, MemorySink, NullSink, Phase, TelemetrySink, TelemetryWriter};
pub use train_config::TrainerConfig;
pub use trainer::{EvalPhase, Trainer};
pub use training_state::{TrainingState, TrainingStateSchema};
