use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::data::{epoch_seed, Batch, BatchIterator, Fields};
use crate::error::{Result, TrainError};
use crate::loss::{LossGraph, LossKind};
use crate::math::StateDict;
use crate::metrics::{EpochMetrics, Metric};
use crate::model::{Mode, Model, ModelInput};
use crate::optim::{LearningRateScheduler, Optimizer};
use crate::train::checkpointer::Checkpointer;
use crate::train::execution::{ExecutionStrategy, StepOutcome};
use crate::train::gradient::GradientController;
use crate::train::mask::{generate_mask, padding_mask};
use crate::train::metric_tracker::MetricTracker;
use crate::train::metrics_io::{self, MetricsRecord};
use crate::train::resource;
use crate::train::telemetry::{JsonLinesSink, NullSink, TelemetrySink, TelemetryWriter};
use crate::train::train_config::TrainerConfig;
use crate::train::training_state::{TrainingState, TRAINING_STATE_VERSION};

/// Which held-out iterator an evaluation pass reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Validation,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Train,
    Eval(EvalPhase),
}

/// Drives training of one model: epochs, batches, validation, early
/// stopping, checkpointing and the final test pass.
///
/// Everything the loop touches is owned here and configured once at
/// construction; `learn` may be called on a fresh trainer pointed at an
/// existing serialization directory to resume a run.
pub struct Trainer<M> {
    config: TrainerConfig,
    execution: ExecutionStrategy<M>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LearningRateScheduler>>,
    loss: Option<LossKind>,
    metric: Box<dyn Metric>,
    metric_tracker: MetricTracker,
    gradient: GradientController,
    checkpointer: Option<Checkpointer>,
    telemetry: TelemetryWriter,
    train_iter: Option<Box<dyn BatchIterator>>,
    val_iter: Option<Box<dyn BatchIterator>>,
    test_iter: Option<Box<dyn BatchIterator>>,
    fields: Option<Fields>,
    model_conf: Option<Value>,
    /// Reseeded from `seed` at the start of every training epoch.
    rng: StdRng,
    seed: u64,
    batch_num_total: u64,
    batch_sizes_seen: u64,
    /// Process high-water mark from the last memory reading.
    cpu_peak_mb: Option<f64>,
}

impl<M: Model + Clone> Trainer<M> {
    /// Resolves every configured component. Fails before any training step
    /// when the configuration is invalid or the execution strategy cannot
    /// be set up.
    pub fn new(model: M, train_iter: Box<dyn BatchIterator>, config: TrainerConfig) -> Result<Trainer<M>> {
        config.validate()?;
        let execution = ExecutionStrategy::new(model, &config.execution)?;
        let optimizer = config.optimizer.build()?;
        let metric_tracker = MetricTracker::new(config.patience, &config.validation_metric)?;
        let scheduler = config
            .learning_rate_scheduler
            .as_ref()
            .map(|s| s.build(metric_tracker.higher_is_better()));
        let metric = config.metric.build(config.label_index);
        let checkpointer = config
            .serialization_dir
            .as_ref()
            .map(|dir| Checkpointer::new(dir, config.num_serialized_models_to_keep));
        let sink: Box<dyn TelemetrySink> = match &config.serialization_dir {
            Some(dir) => Box::new(JsonLinesSink::create(dir)?),
            None => Box::new(NullSink),
        };
        let telemetry = TelemetryWriter::new(
            sink,
            config.summary_interval,
            config.histogram_interval,
            config.should_log_parameter_statistics,
            config.should_log_learning_rate,
        );

        Ok(Trainer {
            gradient: GradientController::new(config.grad_norm, config.grad_clipping),
            loss: config.loss,
            rng: StdRng::seed_from_u64(config.seed),
            seed: config.seed,
            config,
            execution,
            optimizer,
            scheduler,
            metric,
            metric_tracker,
            checkpointer,
            telemetry,
            train_iter: Some(train_iter),
            val_iter: None,
            test_iter: None,
            fields: None,
            model_conf: None,
            batch_num_total: 0,
            batch_sizes_seen: 0,
            cpu_peak_mb: None,
        })
    }
}

impl<M: Model> Trainer<M> {
    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    pub fn with_validation(mut self, iter: Box<dyn BatchIterator>) -> Self {
        self.val_iter = Some(iter);
        self
    }

    pub fn with_test(mut self, iter: Box<dyn BatchIterator>) -> Self {
        self.test_iter = Some(iter);
        self
    }

    /// Replaces the telemetry sink chosen from the serialization directory.
    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry.replace_sink(sink);
        self
    }

    /// Replaces the metric built from the configured `MetricKind`.
    pub fn with_metric(mut self, metric: Box<dyn Metric>) -> Self {
        self.metric = metric;
        self
    }

    /// Vocabularies dumped next to the checkpoints once training ends.
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Model configuration dumped as `conf.json`.
    pub fn with_model_conf(mut self, conf: Value) -> Self {
        self.model_conf = Some(conf);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        self.execution.model()
    }

    pub fn into_model(self) -> M {
        self.execution.into_model()
    }

    pub fn execution(&self) -> &ExecutionStrategy<M> {
        &self.execution
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> Option<&dyn LearningRateScheduler> {
        self.scheduler.as_deref()
    }

    pub fn metric_tracker(&self) -> &MetricTracker {
        &self.metric_tracker
    }

    pub fn batch_num_total(&self) -> u64 {
        self.batch_num_total
    }

    /// Seed of the per-epoch random streams; a restored checkpoint's seed
    /// wins over the configured one.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn serialization_dir(&self) -> Option<PathBuf> {
        self.config.serialization_dir.clone()
    }

    // -----------------------------------------------------------------------
    // Training loop
    // -----------------------------------------------------------------------

    /// Runs the whole training lifecycle and returns the cumulative metrics.
    ///
    /// A checkpoint that exists but cannot be loaded is fatal
    /// ([`TrainError::Restore`]); an empty serialization directory starts
    /// from epoch 0.
    pub fn learn(&mut self) -> Result<MetricsRecord> {
        let epoch_counter = self.restore_checkpoint().map_err(|e| TrainError::Restore(Box::new(e)))?;

        self.gradient.install_clipping(&mut self.execution.parameters_mut());
        info!(execution = %self.execution.describe(), "beginning training");

        let training_start = Instant::now();
        let mut training_epochs = 0;
        let mut metrics = MetricsRecord::new();
        metrics.insert("best_epoch".to_string(), json!(self.metric_tracker.best_epoch()));
        for (key, value) in self.metric_tracker.best_epoch_metrics() {
            metrics.insert(format!("best_validation_{key}"), json!(value));
        }

        for epoch in epoch_counter..self.config.num_epochs {
            let train_metrics = self.train_epoch(epoch)?;

            record_peaks(&mut metrics, &train_metrics, self.cpu_peak_mb);

            let mut val_metrics = None;
            let mut this_epoch_val_metric = None;
            if self.val_iter.is_some() {
                let (val_loss, num_batches) = self.val_epoch(EvalPhase::Validation)?;
                let epoch_val_metrics = self.get_metrics(val_loss, num_batches, true);
                let name = self.metric_tracker.metric_name();
                let value = *epoch_val_metrics.get(name).ok_or_else(|| TrainError::MissingValidationMetric {
                    name: name.to_string(),
                    available: epoch_val_metrics.keys().cloned().collect(),
                })?;
                self.metric_tracker.add_metric(value);
                this_epoch_val_metric = Some(value);
                val_metrics = Some(epoch_val_metrics);
            }
            let out_of_patience = val_metrics.is_some() && self.metric_tracker.should_stop_early();

            self.telemetry.log_metrics(&train_metrics, val_metrics.as_ref(), epoch, true)?;

            training_epochs += 1;
            let elapsed = training_start.elapsed().as_secs();
            metrics.insert("training_duration".to_string(), json!(metrics_io::format_duration(elapsed)));
            metrics.insert("training_start_epoch".to_string(), json!(epoch_counter));
            metrics.insert("training_epochs".to_string(), json!(training_epochs));
            metrics.insert("epoch".to_string(), json!(epoch));
            for (key, value) in &train_metrics {
                metrics.insert(format!("training_{key}"), json!(value));
            }
            let val_metrics = val_metrics.unwrap_or_default();
            for (key, value) in &val_metrics {
                metrics.insert(format!("validation_{key}"), json!(value));
            }

            if self.metric_tracker.is_best_so_far() {
                metrics.insert("best_epoch".to_string(), json!(epoch));
                for (key, value) in &val_metrics {
                    metrics.insert(format!("best_validation_{key}"), json!(value));
                }
                self.metric_tracker.set_best_epoch_metrics(val_metrics);
            }

            if let Some(dir) = self.serialization_dir() {
                metrics_io::dump_metrics(&dir.join(format!("metrics_epoch_{epoch}.json")), &metrics, false)?;
            }

            if let Some(scheduler) = &mut self.scheduler {
                scheduler.step(this_epoch_val_metric, epoch, self.optimizer.as_mut());
            }

            self.save_checkpoint(epoch)?;

            if out_of_patience {
                info!(epoch, "ran out of patience; stopping training");
                break;
            }
        }

        if self.test_iter.is_some() {
            let test_metrics = self.test()?;
            for (key, value) in &test_metrics {
                metrics.insert(format!("test_{key}"), value.clone());
            }
        }

        self.dump_info()?;
        Ok(metrics)
    }

    /// Evaluates the best checkpoint on the test iterator and writes
    /// `test_metrics.json`.
    fn test(&mut self) -> Result<MetricsRecord> {
        let best = match &self.checkpointer {
            Some(checkpointer) => checkpointer.best_model_state()?,
            None => None,
        };
        match best {
            Some(state) => self.execution.load_state_dict(&state)?,
            None => warn!("no best checkpoint recorded; testing the current weights"),
        }

        let (test_loss, test_batches) = self.val_epoch(EvalPhase::Test)?;
        let mut record: MetricsRecord = self
            .get_metrics(test_loss, test_batches, true)
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect();
        record.insert("label_index".to_string(), json!(self.config.label_index));
        if let Some(dir) = self.serialization_dir() {
            metrics_io::dump_metrics(&dir.join("test_metrics.json"), &record, true)?;
        }
        Ok(record)
    }

    /// One training pass over every batch.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochMetrics> {
        info!("epoch {}/{}", epoch + 1, self.config.num_epochs);
        self.metric.reset();
        self.batch_sizes_seen = 0;
        self.rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch));

        let (train_loss, batches_this_epoch) = self.with_iterator(Split::Train, |this, iter| {
            iter.set_epoch(epoch);
            let mut train_loss = 0.0;
            let mut batches_this_epoch = 0;
            for batch in iter.iter_epoch() {
                let batch = batch?;
                batches_this_epoch += 1;
                this.batch_num_total += 1;
                train_loss += this.train_batch(&batch, batches_this_epoch, train_loss)?;
            }
            Ok((train_loss, batches_this_epoch))
        })?;

        let mut metrics = self.get_metrics(train_loss, batches_this_epoch, true);
        if let Some((rss, peak)) = resource::cpu_memory_mb() {
            metrics.insert("cpu_memory_MB".to_string(), rss);
            self.cpu_peak_mb = Some(peak);
        }
        Ok(metrics)
    }

    /// Zero grads, forward, loss, backward, gradient control, step and
    /// telemetry for one batch. Returns the batch loss.
    fn train_batch(&mut self, batch: &Batch, batches_this_epoch: usize, loss_so_far: f64) -> Result<f64> {
        let step = self.batch_num_total;
        self.execution.zero_grad();

        let graph = self.batch_loss(batch, Mode::Train)?;
        if graph.value.is_nan() {
            return Err(TrainError::NanLoss { batch: step });
        }
        self.execution.backward(&graph)?;
        let batch_grad_norm = self.gradient.rescale(&mut self.execution.parameters_mut());

        let outcome = if self.telemetry.should_log_histograms_this_batch(step) {
            let before: StateDict = self.execution.state_dict();
            let outcome = self.execution.step(self.optimizer.as_mut());
            let ratios: BTreeMap<String, f64> = self
                .execution
                .parameters()
                .into_iter()
                .filter_map(|p| {
                    let mut update = before.get(&p.name)?.clone();
                    update.add_scaled(&p.value, -1.0);
                    Some((p.name.clone(), update.norm() / (p.value.norm() + 1e-7)))
                })
                .collect();
            self.telemetry.log_gradient_updates(&ratios, step)?;
            outcome
        } else {
            self.execution.step(self.optimizer.as_mut())
        };
        if let StepOutcome::Skipped { scale } = outcome {
            debug!(batch = step, scale, "optimizer step skipped");
        }

        let loss_so_far = loss_so_far + graph.value;
        if self.telemetry.should_log_this_batch(step) {
            self.telemetry
                .log_parameter_and_gradient_statistics(&self.execution.parameters(), batch_grad_norm, step)?;
            self.telemetry.log_learning_rates(self.optimizer.learning_rate(), step)?;

            let metrics = self.get_metrics(loss_so_far, batches_this_epoch, false);
            self.telemetry.add_train_scalar("loss/loss_train", metrics["loss"], step)?;
            for (name, value) in &metrics {
                self.telemetry.add_train_scalar(&format!("epoch_metrics/{name}"), *value, step)?;
            }
            debug!(batch = step, loss = metrics["loss"], "training");
        }

        if self.telemetry.should_log_histograms_this_batch(step) {
            self.telemetry.log_histograms(&self.execution.parameters(), step)?;
        }

        if let Some(period) = self.config.log_batch_size_period.filter(|&p| p > 0) {
            self.batch_sizes_seen += batch.batch_size() as u64;
            if step % period == 0 {
                let mean = self.batch_sizes_seen as f64 / batches_this_epoch as f64;
                self.telemetry.log_batch_size(batch.batch_size(), mean, step)?;
            }
        }

        Ok(graph.value)
    }

    /// One evaluation pass; returns `(cumulative_loss, batch_count)`.
    /// No backward pass and no parameter updates happen here.
    pub fn val_epoch(&mut self, phase: EvalPhase) -> Result<(f64, usize)> {
        match phase {
            EvalPhase::Validation => info!("validating"),
            EvalPhase::Test => info!("testing"),
        }
        self.metric.reset();
        self.with_iterator(Split::Eval(phase), |this, iter| {
            let mut loss = 0.0;
            let mut batches = 0;
            for batch in iter.iter_epoch() {
                let graph = this.batch_loss(&batch?, Mode::Eval)?;
                loss += graph.value;
                batches += 1;
            }
            Ok((loss, batches))
        })
    }

    /// Runs the model on one batch, resolves the loss and feeds the metric.
    pub fn batch_loss(&mut self, batch: &Batch, mode: Mode) -> Result<LossGraph> {
        batch.validate()?;
        let mask = match &batch.lengths {
            Some(lengths) => generate_mask(lengths, batch.seq_len()),
            None => padding_mask(&batch.text, self.config.padding_idx),
        };
        let input = ModelInput {
            tokens: &batch.text,
            lengths: batch.lengths.as_deref(),
            mask: &mask,
            labels: Some(&batch.labels),
        };
        let output = self.execution.forward(&input, mode, &mut self.rng)?;

        let graph = match output.loss {
            Some(loss) => LossGraph::new(loss),
            None => {
                let loss = self.loss.ok_or(TrainError::MissingLoss)?;
                let graph = LossGraph::new(loss.compute(&output.logits, &batch.labels)?);
                match (output.coefficient, output.regularization_loss) {
                    (Some(coefficient), Some(regularization)) => graph.with_regularization(coefficient, regularization),
                    _ => graph,
                }
            }
        };
        self.metric.update(&output.logits, &batch.labels);
        Ok(graph)
    }

    /// Current metric values plus the average `loss`.
    pub fn get_metrics(&mut self, loss: f64, batches: usize, reset: bool) -> EpochMetrics {
        let mut metrics = self.metric.compute(reset);
        let average = if loss > 0.0 { loss / (batches as f64 + 1e-8) } else { 0.0 };
        metrics.insert("loss".to_string(), average);
        metrics
    }

    /// Lends the iterator for `split` to `f` while keeping `self` mutable.
    fn with_iterator<T>(
        &mut self,
        split: Split,
        f: impl FnOnce(&mut Self, &mut dyn BatchIterator) -> Result<T>,
    ) -> Result<T>
    where
        T: Default,
    {
        let slot = match split {
            Split::Train => &mut self.train_iter,
            Split::Eval(EvalPhase::Validation) => &mut self.val_iter,
            Split::Eval(EvalPhase::Test) => &mut self.test_iter,
        };
        let Some(mut iter) = slot.take() else {
            warn!(?split, "no iterator configured; skipping");
            return Ok(T::default());
        };
        let result = f(self, iter.as_mut());
        match split {
            Split::Train => self.train_iter = Some(iter),
            Split::Eval(EvalPhase::Validation) => self.val_iter = Some(iter),
            Split::Eval(EvalPhase::Test) => self.test_iter = Some(iter),
        }
        result
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Saves the wrapped model and the training state for `epoch`.
    pub fn save_checkpoint(&mut self, epoch: usize) -> Result<()> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let training_state = TrainingState {
            version: TRAINING_STATE_VERSION,
            epoch,
            batch_num_total: self.batch_num_total,
            optimizer: self.optimizer.state_dict()?,
            learning_rate_scheduler: self.scheduler.as_ref().map(|s| s.state_dict()).transpose()?,
            metric_tracker: self.metric_tracker.state_dict(),
            loss_scaler: self.execution.loss_scaler_state(),
            seed: Some(self.seed),
        };
        checkpointer.save_checkpoint(
            &self.execution.state_dict(),
            epoch,
            &training_state,
            self.metric_tracker.is_best_so_far(),
        )?;
        Ok(())
    }

    /// Restores model, optimizer, scheduler, tracker and loss scaler from the
    /// latest checkpoint. Returns the epoch to resume from (0 when there is
    /// nothing to restore).
    pub fn restore_checkpoint(&mut self) -> Result<usize> {
        let restored = match &self.checkpointer {
            Some(checkpointer) => checkpointer.restore_checkpoint()?,
            None => None,
        };
        let Some((model_state, schema)) = restored else {
            self.metric_tracker.clear();
            return Ok(0);
        };

        let state = schema.migrate(&self.metric_tracker)?;
        self.execution.load_state_dict(&model_state)?;
        self.optimizer.load_state_dict(state.optimizer)?;
        if let (Some(scheduler), Some(scheduler_state)) = (&mut self.scheduler, state.learning_rate_scheduler) {
            scheduler.load_state_dict(scheduler_state)?;
        }
        self.metric_tracker.load_state_dict(state.metric_tracker);
        self.execution.load_loss_scaler_state(state.loss_scaler);
        self.batch_num_total = state.batch_num_total;
        if let Some(seed) = state.seed {
            if seed != self.seed {
                warn!(saved = seed, configured = self.seed, "resuming with the seed of the interrupted run");
            }
            self.seed = seed;
        }

        info!(epoch = state.epoch + 1, "resuming training");
        Ok(state.epoch + 1)
    }

    /// Writes vocabularies and model configuration next to the checkpoints.
    pub fn dump_info(&self) -> Result<()> {
        match (self.serialization_dir(), &self.fields) {
            (Some(dir), Some(fields)) => metrics_io::dump_info(&dir, fields, self.model_conf.as_ref())?,
            (Some(dir), None) => {
                if let Some(conf) = &self.model_conf {
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("conf.json"), serde_json::to_string_pretty(conf)?)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Folds an epoch's resource readings into the running `peak_*` entries,
/// which only ever grow. `cpu_peak_mb` is the process high-water mark, which
/// also covers spikes between two resident-set readings.
fn record_peaks(metrics: &mut MetricsRecord, train_metrics: &EpochMetrics, cpu_peak_mb: Option<f64>) {
    let readings = train_metrics.iter().filter_map(|(key, value)| match key.as_str() {
        "cpu_memory_MB" => Some(("peak_cpu_memory_MB".to_string(), value.max(cpu_peak_mb.unwrap_or(0.0)))),
        k if k.starts_with("gpu_") => Some((format!("peak_{k}"), *value)),
        _ => None,
    });
    for (peak, value) in readings {
        let previous = metrics.get(&peak).and_then(Value::as_f64).unwrap_or(0.0);
        metrics.insert(peak, json!(previous.max(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(pairs: &[(&str, f64)]) -> EpochMetrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn cpu_peak_uses_the_high_water_mark() {
        let mut metrics = MetricsRecord::new();
        record_peaks(&mut metrics, &readings(&[("cpu_memory_MB", 100.0), ("loss", 0.5)]), Some(180.0));
        assert_eq!(metrics["peak_cpu_memory_MB"], json!(180.0));
        assert!(!metrics.contains_key("peak_loss"));

        // A later epoch with a lower reading never lowers the peak.
        record_peaks(&mut metrics, &readings(&[("cpu_memory_MB", 90.0)]), Some(150.0));
        assert_eq!(metrics["peak_cpu_memory_MB"], json!(180.0));
    }

    #[test]
    fn peaks_fall_back_to_readings() {
        let mut metrics = MetricsRecord::new();
        record_peaks(&mut metrics, &readings(&[("cpu_memory_MB", 64.0), ("gpu_0_memory_MB", 8.0)]), None);
        record_peaks(&mut metrics, &readings(&[("cpu_memory_MB", 72.0), ("gpu_0_memory_MB", 4.0)]), None);
        assert_eq!(metrics["peak_cpu_memory_MB"], json!(72.0));
        assert_eq!(metrics["peak_gpu_0_memory_MB"], json!(8.0));
    }
}
