use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::loss::LossKind;
use crate::metrics::MetricKind;
use crate::optim::{OptimizerConfig, SchedulerConfig};
use crate::train::execution::ExecutionConfig;
use crate::train::metric_tracker::MetricTracker;

/// Configuration of a training run.
///
/// # Fields
/// - `num_epochs`          — epochs to run, counting those already completed before a resume
/// - `loss`                — applied when the model returns no loss of its own
/// - `metric`              — streaming metric computed in every phase
/// - `label_index`         — positive class for `f1_measure`; recorded in `test_metrics.json`
/// - `serialization_dir`   — checkpoints, metrics and telemetry; `None` disables all of them
/// - `patience`            — early-stopping patience; `None` never stops early
/// - `validation_metric`   — `+name` (higher is better) or `-name` (lower is better)
/// - `grad_norm`           — global gradient norm limit
/// - `grad_clipping`       — element-wise gradient clamp
/// - `summary_interval`    — batches between scalar summaries
/// - `histogram_interval`  — batches between histograms; `None` disables
/// - `log_batch_size_period` — batches between batch-size scalars; `None` disables
/// - `num_serialized_models_to_keep` — retained epoch checkpoints; `None` keeps all
/// - `padding_idx`         — token id treated as padding when batches carry no lengths
/// - `execution`           — data-parallel / mixed-precision options
/// - `seed`                — seeds dropout and replica randomness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub loss: Option<LossKind>,
    pub metric: MetricKind,
    pub label_index: usize,
    pub serialization_dir: Option<PathBuf>,
    pub patience: Option<usize>,
    pub validation_metric: String,
    pub grad_norm: Option<f64>,
    pub grad_clipping: Option<f64>,
    pub optimizer: OptimizerConfig,
    pub learning_rate_scheduler: Option<SchedulerConfig>,
    pub summary_interval: u64,
    pub histogram_interval: Option<u64>,
    pub should_log_parameter_statistics: bool,
    pub should_log_learning_rate: bool,
    pub log_batch_size_period: Option<u64>,
    pub num_serialized_models_to_keep: Option<usize>,
    pub padding_idx: usize,
    pub execution: ExecutionConfig,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            num_epochs: 20,
            loss: Some(LossKind::CrossEntropy),
            metric: MetricKind::F1Measure,
            label_index: 1,
            serialization_dir: None,
            patience: None,
            validation_metric: "+f1_measure".to_string(),
            grad_norm: None,
            grad_clipping: None,
            optimizer: OptimizerConfig::default(),
            learning_rate_scheduler: None,
            summary_interval: 200,
            histogram_interval: None,
            should_log_parameter_statistics: true,
            should_log_learning_rate: false,
            log_batch_size_period: None,
            num_serialized_models_to_keep: Some(20),
            padding_idx: 1,
            execution: ExecutionConfig::default(),
            seed: 42,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        MetricTracker::new(self.patience, &self.validation_metric)?;
        if self.summary_interval == 0 {
            return Err(ConfigError::Invalid("summary_interval must be positive".to_string()));
        }
        for (name, value) in [("grad_norm", self.grad_norm), ("grad_clipping", self.grad_clipping)] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(ConfigError::Invalid(format!("{name} {v} must be positive")));
                }
            }
        }
        if self.num_serialized_models_to_keep == Some(0) {
            return Err(ConfigError::Invalid(
                "num_serialized_models_to_keep must be positive or null".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).map_err(std::io::Error::other)
    }

    /// Reads and validates a config file. Unknown optimizer, loss, metric or
    /// scheduler names fail here, before any training starts.
    pub fn load_json(path: impl AsRef<Path>) -> Result<TrainerConfig, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: TrainerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}
