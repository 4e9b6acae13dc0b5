use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::math::{Matrix, Parameter};
use crate::optim::optimizer::Optimizer;

/// Stochastic gradient descent with optional momentum and L2 weight decay.
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    velocities: BTreeMap<String, Matrix>,
}

#[derive(Serialize, Deserialize)]
struct SgdState {
    learning_rate: f64,
    velocities: BTreeMap<String, Matrix>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd::with_momentum(learning_rate, 0.0, 0.0)
    }

    pub fn with_momentum(learning_rate: f64, momentum: f64, weight_decay: f64) -> Sgd {
        Sgd { learning_rate, momentum, weight_decay, velocities: BTreeMap::new() }
    }
}

impl Optimizer for Sgd {
    /// Applies one update to every parameter:
    /// `v = μ·v + (g + λ·w)`, `w -= lr·v` (plain `w -= lr·g` when μ = 0).
    fn step(&mut self, params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            let mut update = p.grad.clone();
            if update.shape() != p.value.shape() {
                continue;
            }
            if self.weight_decay != 0.0 {
                update.add_scaled(&p.value, self.weight_decay);
            }
            if self.momentum != 0.0 {
                let v = self
                    .velocities
                    .entry(p.name.clone())
                    .or_insert_with(|| Matrix::zeros(update.rows, update.cols));
                v.scale(self.momentum);
                v.add_scaled(&update, 1.0);
                update = v.clone();
            }
            p.value.add_scaled(&update, -self.learning_rate);
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(SgdState {
            learning_rate: self.learning_rate,
            velocities: self.velocities.clone(),
        })
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error> {
        let state: SgdState = serde_json::from_value(state)?;
        self.learning_rate = state.learning_rate;
        self.velocities = state.velocities;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_step_moves_against_gradient() {
        let mut p = Parameter::new("w", Matrix::from_rows(vec![vec![1.0, 2.0]]));
        p.accumulate_grad(&Matrix::from_rows(vec![vec![0.5, -1.0]]));
        let mut sgd = Sgd::new(0.1);
        sgd.step(&mut [&mut p]);
        assert!((p.value.get(0, 0) - 0.95).abs() < 1e-12);
        assert!((p.value.get(0, 1) - 2.1).abs() < 1e-12);
    }

    #[test]
    fn momentum_state_round_trips() {
        let mut p = Parameter::new("w", Matrix::zeros(1, 1));
        p.accumulate_grad(&Matrix::filled(1, 1, 1.0));
        let mut sgd = Sgd::with_momentum(0.1, 0.9, 0.0);
        sgd.step(&mut [&mut p]);
        sgd.step(&mut [&mut p]);
        // v1 = 1, v2 = 1.9 -> w = -0.29
        assert!((p.value.get(0, 0) + 0.29).abs() < 1e-12);

        let mut restored = Sgd::with_momentum(0.5, 0.9, 0.0);
        restored.load_state_dict(sgd.state_dict().unwrap()).unwrap();
        assert_eq!(restored.learning_rate, 0.1);
        assert_eq!(restored.velocities, sgd.velocities);
    }
}
