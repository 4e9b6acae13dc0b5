//! Model contract consumed by the trainer, plus the TextCNN classifier.

pub mod config;
pub mod textcnn;

use rand::rngs::StdRng;

use crate::error::ModelError;
use crate::loss::{LossGraph, ScalarLoss};
use crate::math::{Matrix, Parameter, StateDict};

pub use config::TextCnnConfig;
pub use textcnn::TextCnn;

/// Whether a forward pass belongs to a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        self == Mode::Train
    }
}

/// One batch as seen by a model.
///
/// `tokens` is batch-major (`[batch][seq_len]`, padded); `mask` is
/// `[batch, seq_len]` with 1.0 on real tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    pub tokens: &'a [Vec<usize>],
    pub lengths: Option<&'a [usize]>,
    pub mask: &'a Matrix,
    pub labels: Option<&'a [usize]>,
}

impl<'a> ModelInput<'a> {
    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }
}

/// The mapping returned by a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Matrix,
    pub loss: Option<ScalarLoss>,
    pub coefficient: Option<f64>,
    pub regularization_loss: Option<f64>,
}

impl ModelOutput {
    pub fn logits(logits: Matrix) -> ModelOutput {
        ModelOutput { logits, loss: None, coefficient: None, regularization_loss: None }
    }
}

/// A trainable classifier.
///
/// `backward` must follow a `forward` in [`Mode::Train`]; it accumulates
/// into each parameter's gradient through [`Parameter::accumulate_grad`].
pub trait Model: Send {
    fn forward(&mut self, input: &ModelInput<'_>, mode: Mode, rng: &mut StdRng) -> Result<ModelOutput, ModelError>;

    fn backward(&mut self, graph: &LossGraph) -> Result<(), ModelError>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Whether the model tolerates reduced-precision forward passes.
    fn supports_mixed_precision(&self) -> bool {
        true
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters().iter().map(|p| p.name.clone()).collect()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn state_dict(&self) -> StateDict {
        self.parameters().into_iter().map(|p| (p.name.clone(), p.value.clone())).collect()
    }

    /// Loads weights by name. Every parameter must be present with the same
    /// shape and no extra entries are allowed.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let names = self.parameter_names();
        if let Some(extra) = state.keys().find(|k| !names.contains(k)) {
            return Err(ModelError::UnexpectedParameter(extra.clone()));
        }
        // Validate everything first so a bad state dict leaves the model untouched.
        for p in self.parameters() {
            let value = state.get(&p.name).ok_or_else(|| ModelError::MissingParameter(p.name.clone()))?;
            if value.shape() != p.value.shape() {
                return Err(ModelError::Shape {
                    context: p.name.clone(),
                    expected: p.value.shape(),
                    actual: value.shape(),
                });
            }
        }
        for p in self.parameters_mut() {
            if let Some(value) = state.get(&p.name) {
                p.value = value.clone();
            }
        }
        Ok(())
    }
}
