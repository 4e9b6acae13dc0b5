use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::math::Parameter;
use crate::optim::adam::Adam;
use crate::optim::sgd::Sgd;

/// Updates parameters from their accumulated gradients.
///
/// Optimizer state is exposed as an opaque JSON blob so the checkpointer can
/// persist it without knowing the optimizer's internals.
pub trait Optimizer: Send {
    fn step(&mut self, params: &mut [&mut Parameter]);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            _ => Err(ConfigError::UnsupportedVariant { kind: "optimizer", name: s.to_string() }),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(kind: OptimizerKind) -> String {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimizer section of the trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: OptimizerKind,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_betas")]
    pub betas: (f64, f64),
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_lr() -> f64 {
    1e-3
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            kind: OptimizerKind::Adam,
            lr: default_lr(),
            momentum: 0.0,
            weight_decay: 0.0,
            betas: default_betas(),
            eps: default_eps(),
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Result<Box<dyn Optimizer>, ConfigError> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::Invalid(format!("learning rate {} must be positive", self.lr)));
        }
        Ok(match self.kind {
            OptimizerKind::Sgd => Box::new(Sgd::with_momentum(self.lr, self.momentum, self.weight_decay)),
            OptimizerKind::Adam => Box::new(Adam::with_betas(self.lr, self.betas, self.eps, self.weight_decay)),
        })
    }
}
