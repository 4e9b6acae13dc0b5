use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use textcnn_learner::data::{sentiment_dataset, InMemoryIterator};
use textcnn_learner::model::config::OneOrMany;
use textcnn_learner::{ActivationFunction, TextCnn, TextCnnConfig, TrainError, Trainer, TrainerConfig};

#[derive(Debug, Parser)]
#[command(name = "textcnn-learner", version, about = "Train a TextCNN classifier with checkpointing and early stopping")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on the built-in sentiment corpus. Re-running with the same
    /// output directory resumes from the latest checkpoint.
    Train {
        /// Trainer configuration (JSON). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Model configuration (JSON); vocabulary and label sizes are taken from the corpus.
        #[arg(long)]
        model_config: Option<PathBuf>,
        /// Serialization directory for checkpoints, metrics and telemetry.
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
    },
}

fn default_model_config() -> TextCnnConfig {
    TextCnnConfig {
        name: "text_cnn".to_string(),
        input_dim: 16,
        vocab_size: 0,
        filter_size: OneOrMany::Many(vec![2, 3]),
        filter_num: OneOrMany::One(8),
        label_num: 0,
        dropout: 0.2,
        activation: ActivationFunction::ReLU,
        l2_coefficient: None,
    }
}

fn train(
    config: Option<PathBuf>,
    model_config: Option<PathBuf>,
    output: PathBuf,
    batch_size: usize,
) -> Result<(), TrainError> {
    let mut trainer_config = match config {
        Some(path) => TrainerConfig::load_json(path)?,
        None => TrainerConfig::default(),
    };
    trainer_config.serialization_dir = Some(output.clone());

    let data = sentiment_dataset();
    let mut model_config = match model_config {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|source| textcnn_learner::ConfigError::Read { path: path.clone(), source })?;
            serde_json::from_str::<TextCnnConfig>(&text).map_err(textcnn_learner::ConfigError::from)?
        }
        None => default_model_config(),
    };
    model_config.vocab_size = data.fields.text.len();
    model_config.label_num = data.fields.label.len();

    let model = TextCnn::new(model_config.clone(), &mut StdRng::seed_from_u64(trainer_config.seed))?;
    let padding_idx = trainer_config.padding_idx;
    let seed = trainer_config.seed;

    let train_iter = InMemoryIterator::new(data.train, batch_size, padding_idx).shuffled(seed);
    let val_iter = InMemoryIterator::new(data.validation, batch_size, padding_idx).with_lengths();
    let test_iter = InMemoryIterator::new(data.test, batch_size, padding_idx).with_lengths();

    let mut trainer = Trainer::new(model, Box::new(train_iter), trainer_config)?
        .with_validation(Box::new(val_iter))
        .with_test(Box::new(test_iter))
        .with_fields(data.fields)
        .with_model_conf(serde_json::to_value(&model_config)?);

    let metrics = trainer.learn()?;
    info!("final metrics: {}", serde_json::to_string_pretty(&metrics)?);
    info!("artifacts written to {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train { config, model_config, output, batch_size } => train(config, model_config, output, batch_size),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
