#![allow(dead_code)]

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use textcnn_learner::data::corpus::Dataset;
use textcnn_learner::data::sentiment_dataset;
use textcnn_learner::loss::ScalarLoss;
use textcnn_learner::model::config::OneOrMany;
use textcnn_learner::optim::{OptimizerConfig, OptimizerKind};
use textcnn_learner::{
    ActivationFunction, Batch, LossGraph, Matrix, Mode, Model, ModelError, ModelInput, ModelOutput, Parameter,
    TextCnn, TextCnnConfig, TrainerConfig,
};

/// A two-class model whose validation accuracy follows a script.
///
/// In training mode every row gets the logits stored in `w`, so gradients
/// and optimizer state are real. In eval mode the `k`-th eval call gets the
/// first `schedule[k]` rows right and the rest wrong; the last entry repeats.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    pub w: Parameter,
    pub schedule: Vec<usize>,
    pub eval_calls: usize,
    /// Train call (1-based) whose loss comes back NaN.
    pub nan_at_train_call: Option<usize>,
    train_calls: usize,
    cached_rows: Option<usize>,
}

impl ScriptedModel {
    pub fn new(schedule: Vec<usize>) -> ScriptedModel {
        ScriptedModel {
            w: Parameter::new("w", Matrix::from_rows(vec![vec![0.1, -0.2]])),
            schedule,
            eval_calls: 0,
            nan_at_train_call: None,
            train_calls: 0,
            cached_rows: None,
        }
    }

    pub fn with_nan_at(mut self, train_call: usize) -> ScriptedModel {
        self.nan_at_train_call = Some(train_call);
        self
    }
}

impl Model for ScriptedModel {
    fn forward(&mut self, input: &ModelInput<'_>, mode: Mode, _rng: &mut StdRng) -> Result<ModelOutput, ModelError> {
        let labels = input.labels.ok_or_else(|| ModelError::InvalidInput("labels required".to_string()))?;
        let rows = input.batch_size();
        match mode {
            Mode::Train => {
                self.train_calls += 1;
                self.cached_rows = Some(rows);
                let logits = Matrix::from_rows(vec![self.w.value.row(0).to_vec(); rows]);
                if self.nan_at_train_call == Some(self.train_calls) {
                    let loss = ScalarLoss { value: f64::NAN, logits_grad: Matrix::zeros(rows, 2) };
                    return Ok(ModelOutput { loss: Some(loss), ..ModelOutput::logits(logits) });
                }
                Ok(ModelOutput::logits(logits))
            }
            Mode::Eval => {
                let correct = self
                    .schedule
                    .get(self.eval_calls)
                    .or(self.schedule.last())
                    .copied()
                    .unwrap_or(0);
                self.eval_calls += 1;
                let mut logits = Matrix::zeros(rows, 2);
                for (i, &label) in labels.iter().enumerate() {
                    let predicted = if i < correct { label } else { 1 - label };
                    logits.set(i, predicted, 5.0);
                }
                Ok(ModelOutput::logits(logits))
            }
        }
    }

    fn backward(&mut self, graph: &LossGraph) -> Result<(), ModelError> {
        self.cached_rows.take().ok_or(ModelError::NoForwardCache)?;
        let grad = graph.logits_grad.sum_rows();
        self.w.accumulate_grad(&grad);
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.w]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.w]
    }
}

/// Two training batches of four two-token examples.
pub fn train_batches() -> Vec<Batch> {
    vec![
        Batch::new(vec![vec![2, 3]; 4], vec![0, 1, 1, 0]),
        Batch::new(vec![vec![4, 5]; 4], vec![1, 1, 0, 1]),
    ]
}

/// One validation batch of ten examples with alternating labels.
pub fn validation_batches() -> Vec<Batch> {
    vec![Batch::new(vec![vec![2, 3]; 10], (0..10).map(|i| i % 2).collect())]
}

/// Plain SGD, categorical accuracy, single device.
pub fn scripted_config(dir: Option<&Path>, num_epochs: usize) -> TrainerConfig {
    TrainerConfig {
        num_epochs,
        metric: "categorical_accuracy".parse().expect("known metric"),
        validation_metric: "+accuracy".to_string(),
        optimizer: OptimizerConfig { kind: OptimizerKind::Sgd, lr: 0.1, ..Default::default() },
        serialization_dir: dir.map(Path::to_path_buf),
        num_serialized_models_to_keep: None,
        ..Default::default()
    }
}

pub fn textcnn(data: &Dataset, dropout: f64, seed: u64) -> TextCnn {
    let config = TextCnnConfig {
        name: "text_cnn".to_string(),
        input_dim: 6,
        vocab_size: data.fields.text.len(),
        filter_size: OneOrMany::Many(vec![1, 2]),
        filter_num: OneOrMany::One(3),
        label_num: data.fields.label.len(),
        dropout,
        activation: ActivationFunction::ReLU,
        l2_coefficient: Some(1e-4),
    };
    TextCnn::new(config, &mut StdRng::seed_from_u64(seed)).expect("valid model config")
}

pub fn dataset() -> Dataset {
    sentiment_dataset()
}
