//! Classification metrics consumed by the trainer through [`Metric`].

pub mod accuracy;
pub mod f1_measure;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::math::Matrix;

pub use accuracy::CategoricalAccuracy;
pub use f1_measure::F1Measure;

/// Metric name -> value for one phase of one epoch.
pub type EpochMetrics = BTreeMap<String, f64>;

/// Streaming metric: `update` once per batch, `compute` at report time.
pub trait Metric: Send {
    /// One row of `logits` per example in `labels`.
    fn update(&mut self, logits: &Matrix, labels: &[usize]);

    fn compute(&mut self, reset: bool) -> EpochMetrics;

    fn reset(&mut self);
}

/// Closed set of metrics a config file may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    F1Measure,
    CategoricalAccuracy,
}

impl MetricKind {
    /// `positive_label` is only used by `F1Measure`.
    pub fn build(&self, positive_label: usize) -> Box<dyn Metric> {
        match self {
            MetricKind::F1Measure => Box::new(F1Measure::new(positive_label)),
            MetricKind::CategoricalAccuracy => Box::new(CategoricalAccuracy::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::F1Measure => "f1_measure",
            MetricKind::CategoricalAccuracy => "categorical_accuracy",
        }
    }
}

impl FromStr for MetricKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f1measure" | "f1_measure" => Ok(MetricKind::F1Measure),
            "categoricalaccuracy" | "categorical_accuracy" | "accuracy" => Ok(MetricKind::CategoricalAccuracy),
            _ => Err(ConfigError::UnsupportedVariant { kind: "metric", name: s.to_string() }),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricKind> for String {
    fn from(kind: MetricKind) -> String {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
