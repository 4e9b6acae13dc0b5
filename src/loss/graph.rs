use crate::math::Matrix;

/// A scalar loss together with its gradient with respect to the logits.
#[derive(Debug, Clone)]
pub struct ScalarLoss {
    pub value: f64,
    pub logits_grad: Matrix,
}

/// The final per-batch objective handed to `Model::backward`.
///
/// `regularization_weight` is the coefficient of the model's own
/// regularization term when that term was folded into `value`; the model is
/// responsible for adding `weight * d(regularization)/d(params)`.
#[derive(Debug, Clone)]
pub struct LossGraph {
    pub value: f64,
    pub logits_grad: Matrix,
    pub regularization_weight: Option<f64>,
}

impl LossGraph {
    pub fn new(loss: ScalarLoss) -> LossGraph {
        LossGraph { value: loss.value, logits_grad: loss.logits_grad, regularization_weight: None }
    }

    /// Adds `coefficient * regularization_loss` to the objective.
    pub fn with_regularization(mut self, coefficient: f64, regularization_loss: f64) -> LossGraph {
        self.value += coefficient * regularization_loss;
        self.regularization_weight = Some(coefficient);
        self
    }

    /// The same objective multiplied by `factor` (loss scaling).
    pub fn scaled(&self, factor: f64) -> LossGraph {
        let mut logits_grad = self.logits_grad.clone();
        logits_grad.scale(factor);
        LossGraph {
            value: self.value * factor,
            logits_grad,
            regularization_weight: self.regularization_weight.map(|w| w * factor),
        }
    }

    /// Rows `start..end` of the logits gradient, keeping the regularization
    /// term only when `keep_regularization` is set.
    pub fn slice_rows(&self, start: usize, end: usize, keep_regularization: bool) -> LossGraph {
        LossGraph {
            value: self.value,
            logits_grad: self.logits_grad.slice_rows(start, end),
            regularization_weight: if keep_regularization { self.regularization_weight } else { None },
        }
    }
}
