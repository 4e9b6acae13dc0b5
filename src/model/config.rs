use std::path::Path;

use serde::{Serialize, Deserialize};

use crate::activation::ActivationFunction;
use crate::error::ConfigError;

/// Either a single value or a list of values in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(usize),
    Many(Vec<usize>),
}

impl OneOrMany {
    fn to_vec(&self) -> Vec<usize> {
        match self {
            OneOrMany::One(v) => vec![*v],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Architecture of a [`TextCnn`](crate::model::TextCnn).
///
/// Saved verbatim as `conf.json` next to the checkpoints so a trained model
/// can be rebuilt without the training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCnnConfig {
    /// Human-readable name, informational only.
    #[serde(default = "default_name")]
    pub name: String,
    /// Embedding width.
    pub input_dim: usize,
    pub vocab_size: usize,
    /// Convolution widths; a single number means one bank.
    pub filter_size: OneOrMany,
    /// Filters per bank; a single number is repeated for every bank.
    pub filter_num: OneOrMany,
    pub label_num: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub activation: ActivationFunction,
    /// When set, the model reports `0.5 * ||fc.weight||²` as its
    /// regularization loss with this coefficient.
    #[serde(default)]
    pub l2_coefficient: Option<f64>,
}

fn default_name() -> String {
    "text_cnn".to_string()
}

impl TextCnnConfig {
    /// Resolved `(filter_sizes, filter_nums)` with equal lengths.
    pub fn filter_banks(&self) -> Result<(Vec<usize>, Vec<usize>), ConfigError> {
        let sizes = self.filter_size.to_vec();
        let nums = match &self.filter_num {
            OneOrMany::One(n) => vec![*n; sizes.len()],
            OneOrMany::Many(v) => v.clone(),
        };
        if sizes.is_empty() || sizes.len() != nums.len() {
            return Err(ConfigError::Invalid(format!(
                "filter_size {sizes:?} and filter_num {nums:?} must be non-empty and of equal length"
            )));
        }
        if sizes.contains(&0) || nums.contains(&0) {
            return Err(ConfigError::Invalid("filter sizes and counts must be positive".to_string()));
        }
        Ok((sizes, nums))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter_banks()?;
        if self.input_dim == 0 || self.vocab_size == 0 || self.label_num == 0 {
            return Err(ConfigError::Invalid(
                "input_dim, vocab_size and label_num must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::Invalid(format!("dropout {} must be in [0, 1)", self.dropout)));
        }
        Ok(())
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).map_err(std::io::Error::other)
    }

    /// Deserializes and validates a config written by `save_json`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<TextCnnConfig, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: TextCnnConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}
