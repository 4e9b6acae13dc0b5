mod common;

use std::path::Path;

use approx::assert_relative_eq;
use serde_json::{json, Value};

use common::{dataset, textcnn};
use textcnn_learner::data::corpus::Dataset;
use textcnn_learner::optim::{OptimizerConfig, OptimizerKind, SchedulerConfig, SchedulerKind};
use textcnn_learner::train::{ExecutionConfig, MixedPrecisionConfig};
use textcnn_learner::{Checkpointer, InMemoryIterator, Model, StateDict, TextCnn, Trainer, TrainerConfig};

fn config(dir: &Path, num_epochs: usize) -> TrainerConfig {
    TrainerConfig {
        num_epochs,
        metric: "categorical_accuracy".parse().unwrap(),
        validation_metric: "+accuracy".to_string(),
        optimizer: OptimizerConfig { kind: OptimizerKind::Adam, lr: 0.01, ..Default::default() },
        learning_rate_scheduler: Some(SchedulerConfig {
            kind: SchedulerKind::StepLr,
            step_size: 1,
            gamma: 0.5,
            factor: 0.1,
            patience: 10,
            mode: None,
            min_lr: 0.0,
        }),
        grad_norm: Some(1.0),
        serialization_dir: Some(dir.to_path_buf()),
        num_serialized_models_to_keep: None,
        ..Default::default()
    }
}

fn trainer(data: &Dataset, config: TrainerConfig) -> Trainer<TextCnn> {
    let padding_idx = config.padding_idx;
    let train = InMemoryIterator::new(data.train.clone(), 4, padding_idx).shuffled(21);
    let validation = InMemoryIterator::new(data.validation.clone(), 3, padding_idx).with_lengths();
    Trainer::new(textcnn(data, 0.5, 11), Box::new(train), config)
        .unwrap()
        .with_validation(Box::new(validation))
}

fn assert_state_close(a: &StateDict, b: &StateDict, epsilon: f64) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (name, x) in a {
        let y = &b[name];
        assert_eq!(x.shape(), y.shape(), "{name}");
        for (u, v) in x.data.iter().zip(&y.data) {
            assert_relative_eq!(*u, *v, epsilon = epsilon, max_relative = epsilon);
        }
    }
}

/// Structural equality of two JSON documents with numbers compared loosely.
fn assert_json_close(a: &Value, b: &Value) {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            assert_relative_eq!(x.as_f64().unwrap(), y.as_f64().unwrap(), max_relative = 1e-12)
        }
        (Value::Array(xs), Value::Array(ys)) => {
            assert_eq!(xs.len(), ys.len());
            xs.iter().zip(ys).for_each(|(x, y)| assert_json_close(x, y));
        }
        (Value::Object(xs), Value::Object(ys)) => {
            assert_eq!(xs.keys().collect::<Vec<_>>(), ys.keys().collect::<Vec<_>>());
            xs.iter().for_each(|(k, x)| assert_json_close(x, &ys[k]));
        }
        _ => assert_eq!(a, b),
    }
}

#[test]
fn restoring_a_checkpoint_reproduces_the_saved_state() {
    let data = dataset();
    let dir = tempfile::tempdir().unwrap();
    let mut first = trainer(&data, config(dir.path(), 2));
    first.learn().unwrap();

    let mut resumed = trainer(&data, config(dir.path(), 3));
    assert_eq!(resumed.restore_checkpoint().unwrap(), 2);

    assert_eq!(resumed.batch_num_total(), first.batch_num_total());
    assert_eq!(resumed.batch_num_total(), 10);
    assert_state_close(&resumed.model().state_dict(), &first.model().state_dict(), 1e-12);
    assert_json_close(&resumed.optimizer().state_dict().unwrap(), &first.optimizer().state_dict().unwrap());
    assert_relative_eq!(resumed.optimizer().learning_rate(), first.optimizer().learning_rate());
    assert_json_close(
        &resumed.scheduler().unwrap().state_dict().unwrap(),
        &first.scheduler().unwrap().state_dict().unwrap(),
    );
    assert_json_close(
        &serde_json::to_value(resumed.metric_tracker().state_dict()).unwrap(),
        &serde_json::to_value(first.metric_tracker().state_dict()).unwrap(),
    );

    // Restoring twice is the same as restoring once.
    assert_eq!(resumed.restore_checkpoint().unwrap(), 2);
    assert_eq!(resumed.metric_tracker().history().len(), 2);
}

#[test]
fn interrupted_run_matches_an_uninterrupted_one() {
    let data = dataset();
    let full_dir = tempfile::tempdir().unwrap();
    let mut full = trainer(&data, config(full_dir.path(), 3));
    let full_metrics = full.learn().unwrap();

    let split_dir = tempfile::tempdir().unwrap();
    trainer(&data, config(split_dir.path(), 2)).learn().unwrap();
    let mut resumed = trainer(&data, config(split_dir.path(), 3));
    let resumed_metrics = resumed.learn().unwrap();

    assert_eq!(resumed_metrics["training_start_epoch"], json!(2));
    assert_eq!(resumed_metrics["training_epochs"], json!(1));
    assert_eq!(resumed.batch_num_total(), full.batch_num_total());
    assert_state_close(&resumed.model().state_dict(), &full.model().state_dict(), 1e-9);
    assert_relative_eq!(
        resumed_metrics["validation_loss"].as_f64().unwrap(),
        full_metrics["validation_loss"].as_f64().unwrap(),
        max_relative = 1e-9
    );
    assert_eq!(resumed.metric_tracker().best_epoch(), full.metric_tracker().best_epoch());
}

#[test]
fn resuming_keeps_the_seed_of_the_interrupted_run() {
    let data = dataset();
    let dir = tempfile::tempdir().unwrap();
    let first = TrainerConfig { seed: 5, ..config(dir.path(), 1) };
    trainer(&data, first).learn().unwrap();

    let checkpointer = Checkpointer::new(dir.path(), None);
    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(checkpointer.training_state_path(0)).unwrap()).unwrap();
    assert_eq!(saved["seed"], json!(5));

    let mut resumed = trainer(&data, TrainerConfig { seed: 99, ..config(dir.path(), 2) });
    assert_eq!(resumed.seed(), 99);
    assert_eq!(resumed.restore_checkpoint().unwrap(), 1);
    assert_eq!(resumed.seed(), 5);
}

#[test]
fn data_parallel_mixed_precision_run_checkpoints_the_unwrapped_model() {
    let data = dataset();
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        execution: ExecutionConfig {
            data_parallel_replicas: Some(2),
            mixed_precision: Some(MixedPrecisionConfig::default()),
        },
        ..config(dir.path(), 2)
    };
    let mut trainer = Trainer::new(
        textcnn(&data, 0.2, 3),
        Box::new(InMemoryIterator::new(data.train.clone(), 5, 1).shuffled(9)),
        config,
    )
    .unwrap()
    .with_validation(Box::new(InMemoryIterator::new(data.validation.clone(), 6, 1)))
    .with_test(Box::new(InMemoryIterator::new(data.test.clone(), 4, 1)));

    assert_eq!(trainer.execution().describe(), "data parallel x2 + mixed precision");
    let metrics = trainer.learn().unwrap();
    assert!(metrics["training_loss"].as_f64().unwrap().is_finite());
    assert!(metrics.contains_key("test_accuracy"));

    let checkpointer = Checkpointer::new(dir.path(), None);
    let (weights, _) = checkpointer.restore_checkpoint().unwrap().unwrap();
    let mut plain = textcnn(&data, 0.2, 4);
    plain.load_state_dict(&weights).unwrap();
    assert_eq!(plain.parameter_names(), trainer.model().parameter_names());

    let training_state: Value =
        serde_json::from_str(&std::fs::read_to_string(checkpointer.training_state_path(1)).unwrap()).unwrap();
    let scale = training_state["loss_scaler"]["scale"].as_f64().unwrap();
    assert!(scale > 0.0 && scale <= 65536.0);
}
