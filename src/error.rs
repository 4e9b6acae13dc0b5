//! Error types for the learner.

use std::path::PathBuf;

use thiserror::Error;

/// Raised while parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported {kind} variant: {name:?}")]
    UnsupportedVariant { kind: &'static str, name: String },

    #[error("validation metric {0:?} must start with '+' (higher is better) or '-' (lower is better)")]
    UnsignedValidationMetric(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Raised by the checkpointer.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} exists but could not be parsed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode checkpoint {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Raised by models when inputs or state do not match their shape.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    Shape {
        context: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("token id {token} is outside the vocabulary of size {vocab_size}")]
    UnknownToken { token: usize, vocab_size: usize },

    #[error("label {label} is outside the {num_labels} known labels")]
    UnknownLabel { label: usize, num_labels: usize },

    #[error("state dict is missing parameter {0:?}")]
    MissingParameter(String),

    #[error("state dict has unexpected parameter {0:?}")]
    UnexpectedParameter(String),

    #[error("backward called before forward")]
    NoForwardCache,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Raised while setting up an execution strategy.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{strategy} is unavailable: {reason}")]
    Unavailable { strategy: &'static str, reason: String },
}

/// Top-level training error.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("nan loss encountered at batch {batch}")]
    NanLoss { batch: u64 },

    #[error(
        "could not recover training from the checkpoint; did you mean to output to a \
         different serialization directory or delete the existing serialization directory? ({0})"
    )]
    Restore(#[source] Box<TrainError>),

    #[error("model produced no loss and no loss function is configured")]
    MissingLoss,

    #[error("validation metric {name:?} not found among {available:?}")]
    MissingValidationMetric { name: String, available: Vec<String> },

    #[error("batch error: {0}")]
    Batch(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = TrainError> = std::result::Result<T, E>;
