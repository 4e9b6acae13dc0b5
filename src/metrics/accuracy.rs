use crate::math::Matrix;
use crate::metrics::{EpochMetrics, Metric};

/// Fraction of rows whose argmax equals the gold label.
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: u64,
    total: u64,
}

impl CategoricalAccuracy {
    pub fn new() -> CategoricalAccuracy {
        CategoricalAccuracy::default()
    }
}

impl Metric for CategoricalAccuracy {
    fn update(&mut self, logits: &Matrix, labels: &[usize]) {
        for (pred, &gold) in logits.argmax_rows().into_iter().zip(labels) {
            self.total += 1;
            if pred == gold {
                self.correct += 1;
            }
        }
    }

    fn compute(&mut self, reset: bool) -> EpochMetrics {
        let accuracy = if self.total == 0 { 0.0 } else { self.correct as f64 / self.total as f64 };
        if reset {
            self.reset();
        }
        EpochMetrics::from([("accuracy".to_string(), accuracy)])
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}
