use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{ConfigError, ModelError};
use crate::layers::{ConvMaxPool, Dense, Dropout, Embedding};
use crate::loss::LossGraph;
use crate::math::{Matrix, Parameter};
use crate::model::{Mode, Model, ModelInput, ModelOutput, TextCnnConfig};

/// Convolutional sentence classifier (Kim, 2014):
/// embedding -> conv + max-over-time pooling -> dropout -> linear.
#[derive(Debug, Clone)]
pub struct TextCnn {
    config: TextCnnConfig,
    embedding: Embedding,
    encoder: ConvMaxPool,
    dropout: Dropout,
    fc: Dense,
    mask: Option<Matrix>,
}

impl TextCnn {
    pub fn new<R: Rng + ?Sized>(config: TextCnnConfig, rng: &mut R) -> Result<TextCnn, ConfigError> {
        config.validate()?;
        let (sizes, nums) = config.filter_banks()?;
        let embedding = Embedding::new("embedding", config.vocab_size, config.input_dim, rng);
        let encoder = ConvMaxPool::new("encoder", config.input_dim, &sizes, &nums, config.activation, rng);
        let fc = Dense::new("fc", encoder.output_dim(), config.label_num, rng);
        Ok(TextCnn {
            dropout: Dropout::new(config.dropout),
            config,
            embedding,
            encoder,
            fc,
            mask: None,
        })
    }

    pub fn config(&self) -> &TextCnnConfig {
        &self.config
    }

    /// Replaces the embedding table with pretrained vectors.
    pub fn load_pretrained_embedding(&mut self, vectors: Matrix) -> Result<(), ModelError> {
        self.embedding.from_pretrained(vectors)
    }
}

impl Model for TextCnn {
    fn forward(&mut self, input: &ModelInput<'_>, mode: Mode, rng: &mut StdRng) -> Result<ModelOutput, ModelError> {
        if input.mask.rows != input.batch_size() {
            return Err(ModelError::Shape {
                context: "mask".to_string(),
                expected: (input.batch_size(), input.mask.cols),
                actual: input.mask.shape(),
            });
        }
        let training = mode.is_training();

        let x = self.embedding.forward(input.tokens, training)?;
        let features = self.encoder.forward(&x, input.mask, training)?;
        let features = self.dropout.forward(&features, training, rng);
        let logits = self.fc.forward(&features, training)?;
        self.mask = training.then(|| input.mask.clone());

        let mut output = ModelOutput::logits(logits);
        if let Some(coefficient) = self.config.l2_coefficient {
            output.coefficient = Some(coefficient);
            output.regularization_loss = Some(0.5 * self.fc.weight.value.sum_squares());
        }
        Ok(output)
    }

    fn backward(&mut self, graph: &LossGraph) -> Result<(), ModelError> {
        let mask = self.mask.take().ok_or(ModelError::NoForwardCache)?;

        let grad_features = self.fc.backward(&graph.logits_grad)?;
        if let Some(weight) = graph.regularization_weight {
            // d(0.5 * ||W||²)/dW = W
            let mut reg = self.fc.weight.value.clone();
            reg.scale(weight);
            self.fc.weight.accumulate_grad(&reg);
        }
        let grad_features = self.dropout.backward(&grad_features)?;
        let grad_x = self.encoder.backward(&grad_features, &mask)?;
        self.embedding.backward(&grad_x)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.embedding.weight];
        params.extend(self.encoder.parameters());
        params.extend(self.fc.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.embedding.weight];
        params.extend(self.encoder.parameters_mut());
        params.extend(self.fc.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossKind;
    use crate::model::config::OneOrMany;
    use rand::SeedableRng;

    fn model(l2: Option<f64>) -> TextCnn {
        let config = TextCnnConfig {
            name: "test".to_string(),
            input_dim: 4,
            vocab_size: 10,
            filter_size: OneOrMany::Many(vec![1, 2]),
            filter_num: OneOrMany::One(3),
            label_num: 2,
            dropout: 0.0,
            activation: Default::default(),
            l2_coefficient: l2,
        };
        TextCnn::new(config, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn forward_shapes_and_parameter_names() {
        let mut m = model(None);
        let tokens = vec![vec![2, 3, 1], vec![4, 1, 1]];
        let mask = Matrix::from_rows(vec![vec![1.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]);
        let input = ModelInput { tokens: &tokens, lengths: None, mask: &mask, labels: None };
        let out = m.forward(&input, Mode::Eval, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out.logits.shape(), (2, 2));
        assert!(out.coefficient.is_none());
        assert_eq!(
            m.parameter_names(),
            vec![
                "embedding.weight",
                "encoder.conv_0.weight",
                "encoder.conv_0.bias",
                "encoder.conv_1.weight",
                "encoder.conv_1.bias",
                "fc.weight",
                "fc.bias",
            ]
        );
    }

    #[test]
    fn gradient_matches_finite_difference_on_fc_bias() {
        let mut m = model(None);
        let tokens = vec![vec![2, 3, 5]];
        let labels = vec![1];
        let mask = Matrix::filled(1, 3, 1.0);
        let input = ModelInput { tokens: &tokens, lengths: None, mask: &mask, labels: Some(&labels) };
        let mut rng = StdRng::seed_from_u64(0);

        let out = m.forward(&input, Mode::Train, &mut rng).unwrap();
        let loss = LossKind::CrossEntropy.compute(&out.logits, &labels).unwrap();
        m.zero_grad();
        m.backward(&LossGraph::new(loss.clone())).unwrap();
        let analytic = m.fc.bias.grad.get(0, 1);

        let h = 1e-6;
        m.fc.bias.value.add_at(0, 1, h);
        let out = m.forward(&input, Mode::Eval, &mut rng).unwrap();
        let bumped = LossKind::CrossEntropy.compute(&out.logits, &labels).unwrap();
        let numeric = (bumped.value - loss.value) / h;
        assert!((analytic - numeric).abs() < 1e-4, "{analytic} vs {numeric}");
    }

    #[test]
    fn l2_term_is_reported_and_backpropagated() {
        let mut m = model(Some(0.5));
        let tokens = vec![vec![1, 2]];
        let mask = Matrix::filled(1, 2, 1.0);
        let input = ModelInput { tokens: &tokens, lengths: None, mask: &mask, labels: None };
        let out = m.forward(&input, Mode::Train, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out.coefficient, Some(0.5));
        let expected = 0.5 * m.fc.weight.value.sum_squares();
        assert!((out.regularization_loss.unwrap() - expected).abs() < 1e-12);

        m.zero_grad();
        let graph = LossGraph {
            value: 0.0,
            logits_grad: Matrix::zeros(1, 2),
            regularization_weight: Some(0.5),
        };
        m.backward(&graph).unwrap();
        let mut reg = m.fc.weight.value.clone();
        reg.scale(0.5);
        assert_eq!(m.fc.weight.grad, reg);
    }

    #[test]
    fn backward_without_training_forward_fails() {
        let mut m = model(None);
        let graph = LossGraph { value: 0.0, logits_grad: Matrix::zeros(1, 2), regularization_weight: None };
        assert!(matches!(m.backward(&graph), Err(ModelError::NoForwardCache)));
    }
}
