use crate::math::Matrix;
use crate::metrics::{EpochMetrics, Metric};

/// Precision / recall / F1 of one positive class against the rest.
#[derive(Debug, Clone, Default)]
pub struct F1Measure {
    positive_label: usize,
    true_positives: u64,
    false_positives: u64,
    false_negatives: u64,
}

impl F1Measure {
    pub fn new(positive_label: usize) -> F1Measure {
        F1Measure { positive_label, ..Default::default() }
    }
}

impl Metric for F1Measure {
    fn update(&mut self, logits: &Matrix, labels: &[usize]) {
        let predictions = logits.argmax_rows();
        for (&pred, &gold) in predictions.iter().zip(labels) {
            let pred_pos = pred == self.positive_label;
            let gold_pos = gold == self.positive_label;
            match (pred_pos, gold_pos) {
                (true, true) => self.true_positives += 1,
                (true, false) => self.false_positives += 1,
                (false, true) => self.false_negatives += 1,
                (false, false) => {}
            }
        }
    }

    fn compute(&mut self, reset: bool) -> EpochMetrics {
        let tp = self.true_positives as f64;
        let precision = tp / (tp + self.false_positives as f64 + 1e-13);
        let recall = tp / (tp + self.false_negatives as f64 + 1e-13);
        let f1 = 2.0 * precision * recall / (precision + recall + 1e-13);
        if reset {
            self.reset();
        }
        EpochMetrics::from([
            ("precision".to_string(), precision),
            ("recall".to_string(), recall),
            ("f1_measure".to_string(), f1),
        ])
    }

    fn reset(&mut self) {
        self.true_positives = 0;
        self.false_positives = 0;
        self.false_negatives = 0;
    }
}
