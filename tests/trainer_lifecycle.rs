mod common;

use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use common::{scripted_config, train_batches, validation_batches, ScriptedModel};
use textcnn_learner::optim::{OptimizerConfig, OptimizerKind};
use textcnn_learner::train::checkpointer::{BEST_MODEL_FILE, BEST_TRAINING_FILE};
use textcnn_learner::train::{MemorySink, Phase};
use textcnn_learner::{Checkpointer, CheckpointError, ConfigError, Model, TrainError, Trainer, TrainerConfig};

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn scripted_trainer(model: ScriptedModel, config: TrainerConfig) -> Trainer<ScriptedModel> {
    Trainer::new(model, Box::new(train_batches()), config).unwrap().with_validation(Box::new(validation_batches()))
}

#[test]
fn stops_after_patience_runs_out_and_keeps_best_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig { patience: Some(2), ..scripted_config(Some(dir.path()), 10) };
    // Accuracy 0.3, 0.5, 0.7, 0.7, 0.7, ...
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![3, 5, 7]), config);

    let metrics = trainer.learn().unwrap();

    assert_eq!(metrics["epoch"], json!(4));
    assert_eq!(metrics["best_epoch"], json!(2));
    assert_eq!(metrics["training_epochs"], json!(5));
    assert_eq!(metrics["training_start_epoch"], json!(0));
    assert_eq!(metrics["best_validation_accuracy"], json!(0.7));
    assert_eq!(trainer.metric_tracker().history(), &[0.3, 0.5, 0.7, 0.7, 0.7]);
    assert_eq!(trainer.model().eval_calls, 5);

    // The stopping epoch is still checkpointed.
    let checkpointer = Checkpointer::new(dir.path(), None);
    assert_eq!(checkpointer.saved_epochs().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        read_json(&dir.path().join(BEST_MODEL_FILE)),
        read_json(&checkpointer.model_path(2)),
    );
    assert_eq!(read_json(&dir.path().join(BEST_TRAINING_FILE))["epoch"], json!(2));

    assert!(dir.path().join("metrics_epoch_4.json").exists());
    assert!(!dir.path().join("metrics_epoch_5.json").exists());
    let last = read_json(&dir.path().join("metrics_epoch_4.json"));
    assert_eq!(last["validation_accuracy"], json!(0.7));
    assert!(last["training_duration"].as_str().is_some_and(|d| d.len() == 8));
}

#[test]
fn without_validation_every_epoch_is_best_and_patience_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig { patience: Some(1), ..scripted_config(Some(dir.path()), 3) };
    let mut trainer = Trainer::new(ScriptedModel::new(vec![0]), Box::new(train_batches()), config).unwrap();

    let metrics = trainer.learn().unwrap();

    assert_eq!(metrics["training_epochs"], json!(3));
    assert_eq!(metrics["best_epoch"], json!(2));
    assert!(!metrics.keys().any(|k| k.starts_with("validation_")));
    assert_eq!(trainer.model().eval_calls, 0);
    assert_eq!(
        read_json(&dir.path().join(BEST_MODEL_FILE)),
        read_json(&Checkpointer::new(dir.path(), None).model_path(2)),
    );
}

#[test]
fn retention_keeps_latest_epochs_and_the_best() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig { num_serialized_models_to_keep: Some(2), ..scripted_config(Some(dir.path()), 5) };
    // Best at epoch 0, worse afterwards.
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![10, 2]), config);
    trainer.learn().unwrap();

    let checkpointer = Checkpointer::new(dir.path(), Some(2));
    assert_eq!(checkpointer.saved_epochs().unwrap(), vec![3, 4]);
    assert!(!checkpointer.model_path(0).exists());
    assert_eq!(read_json(&dir.path().join(BEST_TRAINING_FILE))["epoch"], json!(0));
    assert!(checkpointer.best_model_state().unwrap().is_some());
}

#[test]
fn nan_loss_is_fatal() {
    let config = scripted_config(None, 3);
    // Two batches per epoch: the third train call is the first batch of epoch 1.
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![5]).with_nan_at(3), config);

    let err = trainer.learn().unwrap_err();
    assert!(matches!(err, TrainError::NanLoss { batch: 3 }), "{err}");
}

#[test]
fn corrupt_checkpoint_refuses_to_resume() {
    let dir = tempfile::tempdir().unwrap();
    scripted_trainer(ScriptedModel::new(vec![5]), scripted_config(Some(dir.path()), 1)).learn().unwrap();
    fs::write(Checkpointer::new(dir.path(), None).training_state_path(0), "{ not json").unwrap();

    let mut resumed = scripted_trainer(ScriptedModel::new(vec![5]), scripted_config(Some(dir.path()), 2));
    let err = resumed.learn().unwrap_err();

    assert!(err.to_string().contains("different serialization directory"), "{err}");
    match err {
        TrainError::Restore(inner) => {
            assert!(matches!(*inner, TrainError::Checkpoint(CheckpointError::Corrupt { .. })), "{inner}")
        }
        other => panic!("expected a restore error, got {other}"),
    }
}

fn write_legacy_checkpoint(dir: &Path, epoch: usize, training_state: Value) {
    let mut model = ScriptedModel::new(vec![0]);
    model.w.value.data = vec![0.5, 0.25];
    let checkpointer = Checkpointer::new(dir, None);
    fs::write(checkpointer.model_path(epoch), serde_json::to_string(&model.state_dict()).unwrap()).unwrap();
    fs::write(checkpointer.training_state_path(epoch), training_state.to_string()).unwrap();
}

fn sgd_state() -> Value {
    OptimizerConfig { kind: OptimizerKind::Sgd, lr: 0.1, ..Default::default() }
        .build()
        .unwrap()
        .state_dict()
        .unwrap()
}

#[test]
fn resumes_from_a_checkpoint_without_tracker_state() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_checkpoint(
        dir.path(),
        1,
        json!({ "epoch": 1, "optimizer": sgd_state(), "val_metric_per_epoch": [0.2, 0.6] }),
    );
    let config = TrainerConfig { patience: Some(3), ..scripted_config(Some(dir.path()), 3) };
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![4]), config);

    assert_eq!(trainer.restore_checkpoint().unwrap(), 2);
    assert_eq!(trainer.model().w.value.data, vec![0.5, 0.25]);
    assert_eq!(trainer.metric_tracker().history(), &[0.2, 0.6]);
    assert_eq!(trainer.metric_tracker().best_epoch(), Some(1));

    let metrics = trainer.learn().unwrap();
    assert_eq!(metrics["training_start_epoch"], json!(2));
    assert_eq!(metrics["training_epochs"], json!(1));
    assert_eq!(metrics["best_epoch"], json!(1));
    assert_eq!(trainer.metric_tracker().history(), &[0.2, 0.6, 0.4]);

    // The resumed run writes the current layout.
    let saved = read_json(&Checkpointer::new(dir.path(), None).training_state_path(2));
    assert_eq!(saved["version"], json!(2));
    assert_eq!(saved["metric_tracker"]["history"], json!([0.2, 0.6, 0.4]));
}

#[test]
fn resumes_from_a_mid_epoch_legacy_save() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_checkpoint(dir.path(), 3, json!({ "epoch": "3.1", "optimizer": sgd_state() }));
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![4]), scripted_config(Some(dir.path()), 5));

    assert_eq!(trainer.restore_checkpoint().unwrap(), 4);
    assert!(trainer.metric_tracker().history().is_empty());
}

#[test]
fn fresh_directory_starts_at_epoch_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![4]), scripted_config(Some(&dir.path().join("new")), 1));
    assert_eq!(trainer.restore_checkpoint().unwrap(), 0);
}

#[test]
fn test_pass_uses_the_best_weights_and_writes_its_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![6, 2, 2, 10]), scripted_config(Some(dir.path()), 3))
        .with_test(Box::new(validation_batches()))
        .with_fields(common::dataset().fields)
        .with_model_conf(json!({ "name": "scripted" }));

    let metrics = trainer.learn().unwrap();

    // Three validation passes, then the test pass reads the fourth script entry.
    assert_eq!(metrics["test_accuracy"], json!(1.0));
    assert_eq!(metrics["test_label_index"], json!(1));
    assert_eq!(metrics["best_epoch"], json!(0));
    let best = Checkpointer::new(dir.path(), None).best_model_state().unwrap().unwrap();
    assert_eq!(best, trainer.model().state_dict());

    let test_metrics = read_json(&dir.path().join("test_metrics.json"));
    assert_eq!(test_metrics["label_index"], json!(1));
    assert!(test_metrics["loss"].is_number());

    let vocab = fs::read_to_string(dir.path().join("vocab.txt")).unwrap();
    assert_eq!(vocab.lines().take(2).collect::<Vec<_>>(), vec!["<unk>", "<pad>"]);
    assert_eq!(fs::read_to_string(dir.path().join("target.txt")).unwrap(), "neg\npos\n");
    assert!(dir.path().join("vocab_freq.txt").exists());
    assert_eq!(read_json(&dir.path().join("conf.json"))["name"], json!("scripted"));

    let train_log = fs::read_to_string(dir.path().join("log").join("train.jsonl")).unwrap();
    let first: Value = serde_json::from_str(train_log.lines().next().unwrap()).unwrap();
    assert!(first["name"].is_string() && first["step"].is_u64());
    let validation_log = fs::read_to_string(dir.path().join("log").join("validation.jsonl")).unwrap();
    assert!(validation_log.contains("epoch_metrics/accuracy"));
}

#[test]
fn test_pass_without_checkpoints_uses_current_weights() {
    let mut trainer =
        scripted_trainer(ScriptedModel::new(vec![5]), scripted_config(None, 1)).with_test(Box::new(validation_batches()));
    let metrics = trainer.learn().unwrap();
    assert_eq!(metrics["test_accuracy"], json!(0.5));
}

#[test]
fn telemetry_follows_the_configured_intervals() {
    let sink = MemorySink::new();
    let config = TrainerConfig {
        summary_interval: 1,
        histogram_interval: Some(2),
        should_log_learning_rate: true,
        log_batch_size_period: Some(1),
        grad_norm: Some(10.0),
        ..scripted_config(None, 2)
    };
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![5]), config).with_telemetry(Box::new(sink.clone()));
    trainer.learn().unwrap();

    let records = sink.records();
    assert_eq!(records.series(Phase::Train, "loss/loss_train").len(), 4);
    for name in [
        "gradient_norm",
        "parameter_mean/w",
        "parameter_std/w",
        "gradient_mean/w",
        "learning_rate",
        "gradient_update/w",
        "batch_size",
        "mean_batch_size",
    ] {
        assert!(records.has_scalar(name), "missing {name}");
    }
    assert_eq!(records.series(Phase::Train, "gradient_update/w").len(), 2);
    assert_eq!(records.series(Phase::Train, "batch_size"), vec![4.0; 4]);
    assert_eq!(records.series(Phase::Validation, "epoch_metrics/accuracy"), vec![0.5, 0.5]);
    let steps: Vec<u64> = records.histograms.iter().map(|(_, _, step)| *step).collect();
    assert_eq!(steps, vec![2, 4]);
    assert!(records.histograms.iter().all(|(name, _, _)| name == "parameter_histogram/w"));
}

#[test]
fn invalid_configuration_fails_before_training() {
    let config = TrainerConfig { validation_metric: "accuracy".to_string(), ..scripted_config(None, 1) };
    let err = Trainer::new(ScriptedModel::new(vec![0]), Box::new(train_batches()), config).err().unwrap();
    assert!(matches!(err, TrainError::Config(ConfigError::UnsignedValidationMetric(_))), "{err}");

    let err = serde_json::from_value::<TrainerConfig>(json!({ "optimizer": { "type": "rmsprop" } })).unwrap_err();
    assert!(err.to_string().contains("rmsprop"), "{err}");

    let mut config = scripted_config(None, 1);
    config.execution.data_parallel_replicas = Some(0);
    let err = Trainer::new(ScriptedModel::new(vec![0]), Box::new(train_batches()), config).err().unwrap();
    assert!(matches!(err, TrainError::Execution(_)), "{err}");
}

#[test]
fn missing_validation_metric_is_reported() {
    let config = TrainerConfig { validation_metric: "+f1_measure".to_string(), ..scripted_config(None, 1) };
    let mut trainer = scripted_trainer(ScriptedModel::new(vec![0]), config);
    let err = trainer.learn().unwrap_err();
    assert!(matches!(err, TrainError::MissingValidationMetric { .. }), "{err}");
}
