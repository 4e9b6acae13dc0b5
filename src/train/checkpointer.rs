use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::math::StateDict;
use crate::train::training_state::{TrainingState, TrainingStateSchema};

const MODEL_PREFIX: &str = "model_state_epoch_";
const TRAINING_PREFIX: &str = "training_state_epoch_";
pub const BEST_MODEL_FILE: &str = "best_model_state.json";
pub const BEST_TRAINING_FILE: &str = "best_training_state.json";

/// Saves and restores per-epoch snapshots in a serialization directory.
///
/// Each epoch `N` is a pair `model_state_epoch_N.json` +
/// `training_state_epoch_N.json`. The best epoch is additionally copied to
/// `best_model_state.json` + `best_training_state.json`, which retention
/// never removes.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    serialization_dir: PathBuf,
    num_serialized_models_to_keep: Option<usize>,
}

impl Checkpointer {
    /// `num_serialized_models_to_keep = None` keeps every epoch.
    pub fn new(serialization_dir: impl Into<PathBuf>, num_serialized_models_to_keep: Option<usize>) -> Checkpointer {
        Checkpointer { serialization_dir: serialization_dir.into(), num_serialized_models_to_keep }
    }

    pub fn serialization_dir(&self) -> &Path {
        &self.serialization_dir
    }

    pub fn model_path(&self, epoch: usize) -> PathBuf {
        self.serialization_dir.join(format!("{MODEL_PREFIX}{epoch}.json"))
    }

    pub fn training_state_path(&self, epoch: usize) -> PathBuf {
        self.serialization_dir.join(format!("{TRAINING_PREFIX}{epoch}.json"))
    }

    pub fn save_checkpoint(
        &self,
        model_state: &StateDict,
        epoch: usize,
        training_state: &TrainingState,
        is_best_so_far: bool,
    ) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.serialization_dir).map_err(|source| CheckpointError::Io {
            path: self.serialization_dir.clone(),
            source,
        })?;

        write_json_atomic(&self.model_path(epoch), model_state)?;
        write_json_atomic(&self.training_state_path(epoch), training_state)?;

        if is_best_so_far {
            info!(epoch, "best validation performance so far; copying weights to {BEST_MODEL_FILE}");
            write_json_atomic(&self.serialization_dir.join(BEST_MODEL_FILE), model_state)?;
            write_json_atomic(&self.serialization_dir.join(BEST_TRAINING_FILE), training_state)?;
        }

        self.prune()
    }

    /// Epochs with a complete pair on disk, ascending.
    pub fn saved_epochs(&self) -> Result<Vec<usize>, CheckpointError> {
        let entries = match fs::read_dir(&self.serialization_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CheckpointError::Io { path: self.serialization_dir.clone(), source }),
        };

        let mut epochs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io { path: self.serialization_dir.clone(), source })?;
            let name = entry.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix(MODEL_PREFIX))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if self.training_state_path(epoch).exists() {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    fn prune(&self) -> Result<(), CheckpointError> {
        let Some(keep) = self.num_serialized_models_to_keep else {
            return Ok(());
        };
        let epochs = self.saved_epochs()?;
        let excess = epochs.len().saturating_sub(keep);
        for &epoch in &epochs[..excess] {
            debug!(epoch, "removing old checkpoint");
            for path in [self.model_path(epoch), self.training_state_path(epoch)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(source) => return Err(CheckpointError::Io { path, source }),
                }
            }
        }
        Ok(())
    }

    /// Loads the most recent epoch pair.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet. A file that exists
    /// but does not parse is [`CheckpointError::Corrupt`].
    pub fn restore_checkpoint(&self) -> Result<Option<(StateDict, TrainingStateSchema)>, CheckpointError> {
        let Some(&epoch) = self.saved_epochs()?.last() else {
            return Ok(None);
        };
        info!(epoch, "restoring checkpoint from {}", self.serialization_dir.display());
        let model_state = read_json(&self.model_path(epoch))?;
        let training_state = read_json(&self.training_state_path(epoch))?;
        Ok(Some((model_state, training_state)))
    }

    /// Weights of the best epoch, if one has been recorded.
    pub fn best_model_state(&self) -> Result<Option<StateDict>, CheckpointError> {
        let path = self.serialization_dir.join(BEST_MODEL_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

/// Writes to `<path>.tmp` and renames over `path`, so a failed write never
/// clobbers the previous file.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_string(value).map_err(|source| CheckpointError::Encode { path: path.to_path_buf(), source })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|source| CheckpointError::Io { path: tmp.clone(), source })?;
    fs::rename(&tmp, path).map_err(|source| CheckpointError::Io { path: path.to_path_buf(), source })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|source| CheckpointError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Corrupt { path: path.to_path_buf(), source })
}
