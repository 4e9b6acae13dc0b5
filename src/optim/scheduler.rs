use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::optim::optimizer::Optimizer;

/// Adjusts the optimizer's learning rate once per epoch.
///
/// `metric` is the epoch's validation metric when a validation set exists;
/// schedules that do not need it ignore it.
pub trait LearningRateScheduler: Send {
    fn step(&mut self, metric: Option<f64>, epoch: usize, optimizer: &mut dyn Optimizer);

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error>;
}

/// `lr = base_lr * gamma ^ ((epoch + 1) / step_size)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f64,
    base_lr: Option<f64>,
    last_epoch: Option<usize>,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f64) -> StepLr {
        StepLr { step_size: step_size.max(1), gamma, base_lr: None, last_epoch: None }
    }
}

impl LearningRateScheduler for StepLr {
    fn step(&mut self, _metric: Option<f64>, epoch: usize, optimizer: &mut dyn Optimizer) {
        let base = *self.base_lr.get_or_insert(optimizer.learning_rate());
        let decays = ((epoch + 1) / self.step_size) as i32;
        optimizer.set_learning_rate(base * self.gamma.powi(decays));
        self.last_epoch = Some(epoch);
    }

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error> {
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// improvement of the validation metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub higher_is_better: bool,
    pub min_lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(factor: f64, patience: usize, higher_is_better: bool, min_lr: f64) -> ReduceOnPlateau {
        ReduceOnPlateau { factor, patience, higher_is_better, min_lr, best: None, num_bad_epochs: 0 }
    }

    fn improved(&self, value: f64) -> bool {
        match self.best {
            None => true,
            Some(best) if self.higher_is_better => value > best,
            Some(best) => value < best,
        }
    }
}

impl LearningRateScheduler for ReduceOnPlateau {
    fn step(&mut self, metric: Option<f64>, _epoch: usize, optimizer: &mut dyn Optimizer) {
        let Some(value) = metric else {
            return;
        };
        if self.improved(value) {
            self.best = Some(value);
            self.num_bad_epochs = 0;
            return;
        }
        self.num_bad_epochs += 1;
        if self.num_bad_epochs > self.patience {
            let lr = (optimizer.learning_rate() * self.factor).max(self.min_lr);
            tracing::info!(lr, "reducing learning rate on plateau");
            optimizer.set_learning_rate(lr);
            self.num_bad_epochs = 0;
        }
    }

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error> {
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SchedulerKind {
    StepLr,
    ReduceOnPlateau,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::StepLr => "step_lr",
            SchedulerKind::ReduceOnPlateau => "reduce_on_plateau",
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "step_lr" | "steplr" | "step" => Ok(SchedulerKind::StepLr),
            "reduce_on_plateau" | "reducelronplateau" | "reduce_lr_on_plateau" => Ok(SchedulerKind::ReduceOnPlateau),
            _ => Err(ConfigError::UnsupportedVariant { kind: "learning rate scheduler", name: s.to_string() }),
        }
    }
}

impl TryFrom<String> for SchedulerKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchedulerKind> for String {
    fn from(kind: SchedulerKind) -> String {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateauMode {
    Min,
    Max,
}

/// Scheduler section of the trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub kind: SchedulerKind,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_gamma")]
    pub factor: f64,
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Defaults to the direction of the trainer's validation metric.
    #[serde(default)]
    pub mode: Option<PlateauMode>,
    #[serde(default)]
    pub min_lr: f64,
}

fn default_step_size() -> usize {
    1
}

fn default_gamma() -> f64 {
    0.1
}

fn default_patience() -> usize {
    10
}

impl SchedulerConfig {
    pub fn build(&self, validation_higher_is_better: bool) -> Box<dyn LearningRateScheduler> {
        match self.kind {
            SchedulerKind::StepLr => Box::new(StepLr::new(self.step_size, self.gamma)),
            SchedulerKind::ReduceOnPlateau => {
                let higher = match self.mode {
                    Some(PlateauMode::Max) => true,
                    Some(PlateauMode::Min) => false,
                    None => validation_higher_is_better,
                };
                Box::new(ReduceOnPlateau::new(self.factor, self.patience, higher, self.min_lr))
            }
        }
    }
}
