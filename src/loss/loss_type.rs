use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::{ConfigError, ModelError};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::loss::graph::ScalarLoss;
use crate::loss::mse::MseLoss;
use crate::math::Matrix;

/// Selects the loss the trainer applies when the model does not return one.
///
/// - `CrossEntropy` — softmax + categorical cross-entropy on raw logits.
/// - `Mse`          — mean-squared error against one-hot targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    CrossEntropy,
    Mse,
}

impl LossKind {
    pub fn compute(&self, logits: &Matrix, labels: &[usize]) -> Result<ScalarLoss, ModelError> {
        match self {
            LossKind::CrossEntropy => CrossEntropyLoss::compute(logits, labels),
            LossKind::Mse => MseLoss::compute(logits, labels),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "cross_entropy",
            LossKind::Mse => "mse",
        }
    }
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cross_entropy" | "crossentropy" | "crossentropyloss" => Ok(LossKind::CrossEntropy),
            "mse" | "mseloss" => Ok(LossKind::Mse),
            _ => Err(ConfigError::UnsupportedVariant { kind: "loss", name: s.to_string() }),
        }
    }
}

impl TryFrom<String> for LossKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LossKind> for String {
    fn from(kind: LossKind) -> String {
        kind.as_str().to_string()
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!("CrossEntropyLoss".parse::<LossKind>().unwrap(), LossKind::CrossEntropy);
        assert_eq!("mse".parse::<LossKind>().unwrap(), LossKind::Mse);
    }

    #[test]
    fn unknown_name_is_unsupported() {
        let err = "hinge".parse::<LossKind>().unwrap_err();
        assert!(err.to_string().contains("unsupported loss variant"));
    }

    #[test]
    fn deserializing_unknown_name_fails() {
        assert!(serde_json::from_str::<LossKind>("\"focal\"").is_err());
        assert_eq!(serde_json::from_str::<LossKind>("\"mse\"").unwrap(), LossKind::Mse);
    }
}
