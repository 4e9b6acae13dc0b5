use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::math::{Matrix, Parameter};
use crate::optim::optimizer::Optimizer;

/// Per-parameter first and second moment estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    m: Matrix,
    v: Matrix,
}

/// Adam (Kingma & Ba, 2015) with bias correction and optional L2 decay.
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    step_count: u64,
    moments: BTreeMap<String, Moments>,
}

#[derive(Serialize, Deserialize)]
struct AdamState {
    learning_rate: f64,
    step_count: u64,
    moments: BTreeMap<String, Moments>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam::with_betas(learning_rate, (0.9, 0.999), 1e-8, 0.0)
    }

    pub fn with_betas(learning_rate: f64, betas: (f64, f64), eps: f64, weight_decay: f64) -> Adam {
        Adam {
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            eps,
            weight_decay,
            step_count: 0,
            moments: BTreeMap::new(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        self.step_count += 1;
        let t = self.step_count as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for p in params.iter_mut() {
            if p.grad.shape() != p.value.shape() {
                continue;
            }
            let mut g = p.grad.clone();
            if self.weight_decay != 0.0 {
                g.add_scaled(&p.value, self.weight_decay);
            }
            let state = self.moments.entry(p.name.clone()).or_insert_with(|| Moments {
                m: Matrix::zeros(g.rows, g.cols),
                v: Matrix::zeros(g.rows, g.cols),
            });
            for (((w, &gi), m), v) in p
                .value
                .data
                .iter_mut()
                .zip(&g.data)
                .zip(state.m.data.iter_mut())
                .zip(state.v.data.iter_mut())
            {
                *m = self.beta1 * *m + (1.0 - self.beta1) * gi;
                *v = self.beta2 * *v + (1.0 - self.beta2) * gi * gi;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *w -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(AdamState {
            learning_rate: self.learning_rate,
            step_count: self.step_count,
            moments: self.moments.clone(),
        })
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), serde_json::Error> {
        let state: AdamState = serde_json::from_value(state)?;
        self.learning_rate = state.learning_rate;
        self.step_count = state.step_count;
        self.moments = state.moments;
        Ok(())
    }
}
