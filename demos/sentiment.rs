use rand::rngs::StdRng;
use rand::SeedableRng;

use textcnn_learner::data::{sentiment_dataset, tokenize, InMemoryIterator};
use textcnn_learner::model::config::OneOrMany;
use textcnn_learner::optim::{OptimizerConfig, OptimizerKind};
use textcnn_learner::train::mask::padding_mask;
use textcnn_learner::{Mode, Model, ModelInput, TextCnn, TextCnnConfig, Trainer, TrainerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let data = sentiment_dataset();
    let output = std::env::temp_dir().join("textcnn-sentiment-demo");

    let model_config = TextCnnConfig {
        name: "text_cnn".to_string(),
        input_dim: 12,
        vocab_size: data.fields.text.len(),
        filter_size: OneOrMany::Many(vec![1, 2]),
        filter_num: OneOrMany::One(6),
        label_num: data.fields.label.len(),
        dropout: 0.1,
        activation: Default::default(),
        l2_coefficient: Some(1e-4),
    };
    let model = TextCnn::new(model_config, &mut StdRng::seed_from_u64(7))?;

    let config = TrainerConfig {
        num_epochs: 30,
        patience: Some(5),
        validation_metric: "+accuracy".to_string(),
        metric: "categorical_accuracy".parse()?,
        optimizer: OptimizerConfig { kind: OptimizerKind::Adam, lr: 0.01, ..Default::default() },
        grad_norm: Some(5.0),
        num_serialized_models_to_keep: Some(3),
        serialization_dir: Some(output.clone()),
        seed: 7,
        ..Default::default()
    };

    let train = InMemoryIterator::new(data.train, 4, config.padding_idx).shuffled(1);
    let validation = InMemoryIterator::new(data.validation, 6, config.padding_idx);
    let mut trainer = Trainer::new(model, Box::new(train), config)?
        .with_validation(Box::new(validation))
        .with_fields(data.fields.clone());

    let metrics = trainer.learn()?;
    for key in ["best_epoch", "best_validation_accuracy", "training_duration"] {
        println!("{key}: {}", metrics.get(key).cloned().unwrap_or_default());
    }

    let mut model = trainer.into_model();
    for sentence in ["a wonderful and funny film", "a dull and boring mess"] {
        let tokens = vec![data.fields.text.encode(tokenize(sentence).iter().map(String::as_str))];
        let mask = padding_mask(&tokens, 1);
        let input = ModelInput { tokens: &tokens, lengths: None, mask: &mask, labels: None };
        let out = model.forward(&input, Mode::Eval, &mut StdRng::seed_from_u64(0))?;
        let label = out.logits.argmax_rows()[0];
        println!("{sentence:?} -> {}", data.fields.label.token(label).unwrap_or("?"));
    }
    println!("checkpoints in {}", output.display());
    Ok(())
}
