use crate::error::ModelError;
use crate::loss::cross_entropy::check_labels;
use crate::loss::graph::ScalarLoss;
use crate::math::Matrix;

/// Mean-squared error between the logits and one-hot targets.
pub struct MseLoss;

impl MseLoss {
    /// Scalar MSE: mean((logit - onehot)²) over every element.
    pub fn compute(logits: &Matrix, labels: &[usize]) -> Result<ScalarLoss, ModelError> {
        check_labels(logits, labels)?;
        let n = logits.len().max(1) as f64;
        let mut diff = logits.clone();
        for (i, &label) in labels.iter().enumerate() {
            diff.add_at(i, label, -1.0);
        }
        let value = diff.sum_squares() / n;
        diff.scale(2.0 / n);
        Ok(ScalarLoss { value, logits_grad: diff })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_prediction_has_zero_loss() {
        let logits = Matrix::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
        let loss = MseLoss::compute(&logits, &[1, 0]).unwrap();
        assert_eq!(loss.value, 0.0);
        assert_eq!(loss.logits_grad.sum_squares(), 0.0);
    }

    #[test]
    fn gradient_points_toward_target() {
        let logits = Matrix::from_rows(vec![vec![1.0, 0.0]]);
        let loss = MseLoss::compute(&logits, &[1]).unwrap();
        assert_eq!(loss.value, 1.0);
        assert_eq!(loss.logits_grad.data, vec![1.0, -1.0]);
    }
}
