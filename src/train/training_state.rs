use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::train::execution::LossScalerState;
use crate::train::metric_tracker::{MetricTracker, MetricTrackerState};

pub const TRAINING_STATE_VERSION: u32 = 2;

/// Everything besides the weights needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub version: u32,
    /// Last completed epoch.
    pub epoch: usize,
    pub batch_num_total: u64,
    pub optimizer: Value,
    #[serde(default)]
    pub learning_rate_scheduler: Option<Value>,
    pub metric_tracker: MetricTrackerState,
    #[serde(default)]
    pub loss_scaler: Option<LossScalerState>,
    /// Seed the per-epoch random streams derive from.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Training state written before the tracker state was persisted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainingStateV1 {
    pub epoch: usize,
    #[serde(default)]
    pub batch_num_total: u64,
    pub optimizer: Value,
    #[serde(default)]
    pub learning_rate_scheduler: Option<Value>,
    pub val_metric_per_epoch: Vec<f64>,
}

/// Oldest layout: no metric history at all, and mid-epoch saves recorded
/// the epoch as a string such as `"3.1"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainingStateV0 {
    pub epoch: LegacyEpoch,
    #[serde(default)]
    pub batch_num_total: u64,
    pub optimizer: Value,
    #[serde(default)]
    pub learning_rate_scheduler: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LegacyEpoch {
    Whole(usize),
    Partial(String),
}

impl LegacyEpoch {
    /// The epoch whose data the save belongs to; `"3.1"` -> 3.
    pub fn completed(&self) -> Result<usize, std::num::ParseIntError> {
        match self {
            LegacyEpoch::Whole(epoch) => Ok(*epoch),
            LegacyEpoch::Partial(s) => s.split('.').next().unwrap_or(s).trim().parse(),
        }
    }
}

/// Any training-state layout that can be found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingStateSchema {
    V2(TrainingState),
    V1(TrainingStateV1),
    V0(TrainingStateV0),
}

impl<'de> Deserialize<'de> for TrainingStateSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let version = value.get("version").and_then(Value::as_u64);
        let schema = match version {
            Some(v) if v == u64::from(TRAINING_STATE_VERSION) => {
                TrainingStateSchema::V2(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            Some(v) => return Err(D::Error::custom(format!("unsupported training state version {v}"))),
            None if value.get("val_metric_per_epoch").is_some() => {
                TrainingStateSchema::V1(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            None => TrainingStateSchema::V0(serde_json::from_value(value).map_err(D::Error::custom)?),
        };
        Ok(schema)
    }
}

impl TrainingStateSchema {
    /// Upgrades to the current layout. Older layouts rebuild the tracker
    /// from `tracker`'s configuration: v1 replays its metric history, v0
    /// starts from an empty one.
    pub fn migrate(self, tracker: &MetricTracker) -> Result<TrainingState, serde_json::Error> {
        let mut fresh = tracker.clone();
        fresh.clear();
        Ok(match self {
            TrainingStateSchema::V2(state) => state,
            TrainingStateSchema::V1(v1) => {
                fresh.add_metrics(v1.val_metric_per_epoch);
                TrainingState {
                    version: TRAINING_STATE_VERSION,
                    epoch: v1.epoch,
                    batch_num_total: v1.batch_num_total,
                    optimizer: v1.optimizer,
                    learning_rate_scheduler: v1.learning_rate_scheduler,
                    metric_tracker: fresh.state_dict(),
                    loss_scaler: None,
                    seed: None,
                }
            }
            TrainingStateSchema::V0(v0) => TrainingState {
                version: TRAINING_STATE_VERSION,
                epoch: v0
                    .epoch
                    .completed()
                    .map_err(|e| serde_json::Error::custom(format!("bad legacy epoch: {e}")))?,
                batch_num_total: v0.batch_num_total,
                optimizer: v0.optimizer,
                learning_rate_scheduler: v0.learning_rate_scheduler,
                metric_tracker: fresh.state_dict(),
                loss_scaler: None,
                seed: None,
            },
        })
    }
}
