use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::math::{Matrix, Parameter};
use crate::metrics::EpochMetrics;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination of training telemetry.
pub trait TelemetrySink: Send {
    fn add_train_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()>;

    fn add_validation_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()>;

    fn add_train_histogram(&mut self, name: &str, values: &Matrix, step: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn add_train_scalar(&mut self, _name: &str, _value: f64, _step: u64) -> io::Result<()> {
        Ok(())
    }

    fn add_validation_scalar(&mut self, _name: &str, _value: f64, _step: u64) -> io::Result<()> {
        Ok(())
    }

    fn add_train_histogram(&mut self, _name: &str, _values: &Matrix, _step: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Fixed-width histogram of a tensor's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub const BINS: usize = 10;

    pub fn of(values: &Matrix) -> Histogram {
        let finite = values.data.iter().copied().filter(|v| v.is_finite());
        let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let mut counts = vec![0; Self::BINS];
        if min > max {
            return Histogram { min: 0.0, max: 0.0, counts };
        }
        let width = (max - min) / Self::BINS as f64;
        for &v in values.data.iter().filter(|v| v.is_finite()) {
            let bin = if width > 0.0 { ((v - min) / width) as usize } else { 0 };
            counts[bin.min(Self::BINS - 1)] += 1;
        }
        Histogram { min, max, counts }
    }
}

#[derive(Debug, Serialize)]
struct ScalarLine<'a> {
    step: u64,
    name: &'a str,
    value: f64,
}

#[derive(Debug, Serialize)]
struct HistogramLine<'a> {
    step: u64,
    name: &'a str,
    histogram: Histogram,
}

/// Appends one JSON object per event to `<dir>/log/train.jsonl` and
/// `<dir>/log/validation.jsonl`.
pub struct JsonLinesSink {
    train: LineWriter<File>,
    validation: LineWriter<File>,
}

impl JsonLinesSink {
    pub fn create(serialization_dir: &Path) -> io::Result<JsonLinesSink> {
        let log_dir = serialization_dir.join("log");
        fs::create_dir_all(&log_dir)?;
        let open = |name: &str| fs::OpenOptions::new().create(true).append(true).open(log_dir.join(name));
        Ok(JsonLinesSink {
            train: LineWriter::new(open("train.jsonl")?),
            validation: LineWriter::new(open("validation.jsonl")?),
        })
    }
}

fn write_line<W: Write, T: Serialize>(writer: &mut W, line: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, line)?;
    writer.write_all(b"\n")
}

impl TelemetrySink for JsonLinesSink {
    fn add_train_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        write_line(&mut self.train, &ScalarLine { step, name, value })
    }

    fn add_validation_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        write_line(&mut self.validation, &ScalarLine { step, name, value })
    }

    fn add_train_histogram(&mut self, name: &str, values: &Matrix, step: u64) -> io::Result<()> {
        write_line(&mut self.train, &HistogramLine { step, name, histogram: Histogram::of(values) })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.train.flush()?;
        self.validation.flush()
    }
}

/// Which series a recorded scalar belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validation,
}

/// Everything a [`MemorySink`] has received.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecords {
    pub scalars: Vec<(Phase, String, f64, u64)>,
    pub histograms: Vec<(String, Histogram, u64)>,
}

impl MemoryRecords {
    /// Values of one scalar series, in emission order.
    pub fn series(&self, phase: Phase, name: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|(p, n, _, _)| *p == phase && n == name)
            .map(|(_, _, v, _)| *v)
            .collect()
    }

    pub fn has_scalar(&self, name: &str) -> bool {
        self.scalars.iter().any(|(_, n, _, _)| n == name)
    }
}

/// Keeps telemetry in memory. Clones share the same records, so a test can
/// hand one clone to the trainer and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<MemoryRecords>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn records(&self) -> MemoryRecords {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push_scalar(&self, phase: Phase, name: &str, value: f64, step: u64) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.scalars.push((phase, name.to_string(), value, step));
    }
}

impl TelemetrySink for MemorySink {
    fn add_train_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        self.push_scalar(Phase::Train, name, value, step);
        Ok(())
    }

    fn add_validation_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        self.push_scalar(Phase::Validation, name, value, step);
        Ok(())
    }

    fn add_train_histogram(&mut self, name: &str, values: &Matrix, step: u64) -> io::Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.histograms.push((name.to_string(), Histogram::of(values), step));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Decides when to emit telemetry and what to name it.
///
/// # Fields
/// - `summary_interval`   — scalar summaries every N batches
/// - `histogram_interval` — parameter histograms and update ratios every N batches; `None` disables
/// - `should_log_parameter_statistics` — emit mean/std of parameters and gradients
/// - `should_log_learning_rate`        — emit the optimizer's learning rate
pub struct TelemetryWriter {
    sink: Box<dyn TelemetrySink>,
    summary_interval: u64,
    histogram_interval: Option<u64>,
    should_log_parameter_statistics: bool,
    should_log_learning_rate: bool,
}

impl TelemetryWriter {
    pub fn new(
        sink: Box<dyn TelemetrySink>,
        summary_interval: u64,
        histogram_interval: Option<u64>,
        should_log_parameter_statistics: bool,
        should_log_learning_rate: bool,
    ) -> TelemetryWriter {
        TelemetryWriter {
            sink,
            summary_interval: summary_interval.max(1),
            histogram_interval: histogram_interval.filter(|&h| h > 0),
            should_log_parameter_statistics,
            should_log_learning_rate,
        }
    }

    pub fn null() -> TelemetryWriter {
        TelemetryWriter::new(Box::new(NullSink), 100, None, false, false)
    }

    pub fn replace_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sink = sink;
    }

    pub fn should_log_this_batch(&self, batch_num_total: u64) -> bool {
        batch_num_total % self.summary_interval == 0
    }

    pub fn should_log_histograms_this_batch(&self, batch_num_total: u64) -> bool {
        self.histogram_interval.is_some_and(|h| batch_num_total % h == 0)
    }

    pub fn add_train_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        self.sink.add_train_scalar(name, value, step)
    }

    pub fn add_validation_scalar(&mut self, name: &str, value: f64, step: u64) -> io::Result<()> {
        self.sink.add_validation_scalar(name, value, step)
    }

    /// Mean and std of every parameter and its gradient, plus the global
    /// gradient norm when rescaling observed one.
    pub fn log_parameter_and_gradient_statistics(
        &mut self,
        params: &[&Parameter],
        grad_norm: Option<f64>,
        step: u64,
    ) -> io::Result<()> {
        if !self.should_log_parameter_statistics {
            return Ok(());
        }
        for p in params {
            self.sink.add_train_scalar(&format!("parameter_mean/{}", p.name), p.value.mean(), step)?;
            self.sink.add_train_scalar(&format!("parameter_std/{}", p.name), p.value.std(), step)?;
            if !p.grad.is_empty() {
                self.sink.add_train_scalar(&format!("gradient_mean/{}", p.name), p.grad.mean(), step)?;
                self.sink.add_train_scalar(&format!("gradient_std/{}", p.name), p.grad.std(), step)?;
            }
        }
        if let Some(norm) = grad_norm {
            self.sink.add_train_scalar("gradient_norm", norm, step)?;
        }
        Ok(())
    }

    pub fn log_learning_rates(&mut self, learning_rate: f64, step: u64) -> io::Result<()> {
        if self.should_log_learning_rate {
            self.sink.add_train_scalar("learning_rate", learning_rate, step)?;
        }
        Ok(())
    }

    pub fn log_histograms(&mut self, params: &[&Parameter], step: u64) -> io::Result<()> {
        for p in params {
            self.sink.add_train_histogram(&format!("parameter_histogram/{}", p.name), &p.value, step)?;
        }
        Ok(())
    }

    /// Relative size of the last optimizer step, `|Δθ| / |θ|`, per parameter.
    pub fn log_gradient_updates(&mut self, ratios: &BTreeMap<String, f64>, step: u64) -> io::Result<()> {
        for (name, ratio) in ratios {
            self.sink.add_train_scalar(&format!("gradient_update/{name}"), *ratio, step)?;
        }
        Ok(())
    }

    pub fn log_batch_size(&mut self, batch_size: usize, mean_batch_size: f64, step: u64) -> io::Result<()> {
        self.sink.add_train_scalar("batch_size", batch_size as f64, step)?;
        self.sink.add_train_scalar("mean_batch_size", mean_batch_size, step)
    }

    /// Emits `epoch_metrics/<name>` for both phases and prints a side by side
    /// table to the console.
    pub fn log_metrics(
        &mut self,
        train_metrics: &EpochMetrics,
        val_metrics: Option<&EpochMetrics>,
        epoch: usize,
        log_to_console: bool,
    ) -> io::Result<()> {
        let step = epoch as u64;
        for (name, value) in train_metrics {
            self.sink.add_train_scalar(&format!("epoch_metrics/{name}"), *value, step)?;
        }
        if let Some(val) = val_metrics {
            for (name, value) in val {
                self.sink.add_validation_scalar(&format!("epoch_metrics/{name}"), *value, step)?;
            }
        }

        if log_to_console {
            let mut names: Vec<&String> = train_metrics.keys().collect();
            if let Some(val) = val_metrics {
                names.extend(val.keys().filter(|k| !train_metrics.contains_key(*k)));
            }
            names.sort();
            info!("{:<24} |  {:>10}  |  {:>10}", "", "Training", "Validation");
            for name in names {
                let cell = |m: Option<&EpochMetrics>| {
                    m.and_then(|m| m.get(name)).map_or_else(|| "N/A".to_string(), |v| format!("{v:.3}"))
                };
                info!("{:<24} |  {:>10}  |  {:>10}", name, cell(Some(train_metrics)), cell(val_metrics));
            }
        }
        self.sink.flush()
    }
}
