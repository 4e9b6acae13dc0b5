use crate::error::ModelError;
use crate::loss::graph::ScalarLoss;
use crate::math::Matrix;

/// Softmax + categorical cross-entropy over raw logits.
pub struct CrossEntropyLoss;

/// Small epsilon added inside log() to prevent log(0) = -inf.
const EPS: f64 = 1e-12;

impl CrossEntropyLoss {
    /// Mean over the batch of `-log softmax(logits)[label]`.
    ///
    /// The gradient with respect to the logits simplifies to
    /// `(softmax(logits) - onehot(label)) / batch`.
    pub fn compute(logits: &Matrix, labels: &[usize]) -> Result<ScalarLoss, ModelError> {
        check_labels(logits, labels)?;
        let batch = logits.rows.max(1) as f64;
        let probs = softmax_rows(logits);
        let mut value = 0.0;
        let mut grad = probs.clone();
        for (i, &label) in labels.iter().enumerate() {
            value -= (probs.get(i, label) + EPS).ln();
            grad.add_at(i, label, -1.0);
        }
        grad.scale(1.0 / batch);
        Ok(ScalarLoss { value: value / batch, logits_grad: grad })
    }
}

/// Row-wise softmax, shifted by the row maximum for stability.
pub fn softmax_rows(logits: &Matrix) -> Matrix {
    let mut out = logits.clone();
    for i in 0..out.rows {
        let row = out.row_mut(i);
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for x in row.iter_mut() {
            *x = (*x - max).exp();
            total += *x;
        }
        for x in row.iter_mut() {
            *x /= total;
        }
    }
    out
}

pub(crate) fn check_labels(logits: &Matrix, labels: &[usize]) -> Result<(), ModelError> {
    if labels.len() != logits.rows {
        return Err(ModelError::Shape {
            context: "labels".to_string(),
            expected: (logits.rows, 1),
            actual: (labels.len(), 1),
        });
    }
    if let Some(&label) = labels.iter().find(|&&l| l >= logits.cols) {
        return Err(ModelError::UnknownLabel { label, num_labels: logits.cols });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn uniform_logits_give_log_num_classes() {
        let logits = Matrix::zeros(2, 4);
        let loss = CrossEntropyLoss::compute(&logits, &[0, 3]).unwrap();
        assert_abs_diff_eq!(loss.value, 4.0_f64.ln(), epsilon = 1e-9);
        assert_abs_diff_eq!(loss.logits_grad.get(0, 0), (0.25 - 1.0) / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(loss.logits_grad.get(0, 1), 0.25 / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn out_of_range_label_is_rejected() {
        let logits = Matrix::zeros(1, 2);
        assert!(matches!(
            CrossEntropyLoss::compute(&logits, &[2]),
            Err(ModelError::UnknownLabel { label: 2, num_labels: 2 })
        ));
    }
}
