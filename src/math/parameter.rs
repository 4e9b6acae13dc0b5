use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::math::matrix::Matrix;

/// Serializable snapshot of a model's weights, keyed by parameter name.
pub type StateDict = BTreeMap<String, Matrix>;

/// A trainable tensor together with its accumulated gradient.
///
/// Backward passes add into `grad` with [`Parameter::accumulate_grad`]. The
/// registered clamp, if any, is applied to the summed gradient by
/// [`Parameter::clamp_grad`] once the whole backward pass is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Matrix,
    #[serde(skip)]
    pub grad: Matrix,
    /// Element-wise limit applied to the finished gradient.
    #[serde(skip)]
    grad_clamp: Option<f64>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Matrix) -> Parameter {
        let grad = Matrix::zeros(value.rows, value.cols);
        Parameter { name: name.into(), value, grad, grad_clamp: None }
    }

    pub fn zero_grad(&mut self) {
        if self.grad.shape() != self.value.shape() {
            self.grad = Matrix::zeros(self.value.rows, self.value.cols);
        } else {
            self.grad.fill(0.0);
        }
    }

    /// Adds one backward contribution to the gradient.
    pub fn accumulate_grad(&mut self, contribution: &Matrix) {
        if self.grad.shape() != self.value.shape() {
            self.zero_grad();
        }
        self.grad.add_scaled(contribution, 1.0);
    }

    /// Clamps the accumulated gradient into `[-limit, limit]` when a clamp
    /// is registered.
    pub fn clamp_grad(&mut self) {
        if let Some(limit) = self.grad_clamp {
            self.grad.map_inplace(|g| g.clamp(-limit, limit));
        }
    }

    /// Registers an element-wise clamp applied after every backward pass.
    pub fn register_grad_clamp(&mut self, limit: f64) {
        self.grad_clamp = Some(limit.abs());
    }

    pub fn grad_clamp(&self) -> Option<f64> {
        self.grad_clamp
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bounds_the_summed_gradient() {
        let mut p = Parameter::new("w", Matrix::zeros(1, 3));
        p.register_grad_clamp(1.0);
        p.accumulate_grad(&Matrix::from_rows(vec![vec![5.0, -0.5, -3.0]]));
        p.accumulate_grad(&Matrix::from_rows(vec![vec![5.0, 0.0, 2.5]]));
        assert_eq!(p.grad.data, vec![10.0, -0.5, -0.5]);
        p.clamp_grad();
        assert_eq!(p.grad.data, vec![1.0, -0.5, -0.5]);
    }

    #[test]
    fn clamp_without_limit_is_a_no_op() {
        let mut p = Parameter::new("w", Matrix::zeros(1, 2));
        p.accumulate_grad(&Matrix::from_rows(vec![vec![7.0, -7.0]]));
        p.clamp_grad();
        assert_eq!(p.grad.data, vec![7.0, -7.0]);
    }

    #[test]
    fn zero_grad_resets_accumulation() {
        let mut p = Parameter::new("b", Matrix::zeros(1, 2));
        p.accumulate_grad(&Matrix::filled(1, 2, 3.0));
        p.zero_grad();
        assert_eq!(p.grad.sum(), 0.0);
    }
}
