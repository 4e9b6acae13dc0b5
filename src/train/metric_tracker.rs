use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::metrics::EpochMetrics;

/// Serializable state of a [`MetricTracker`].
///
/// # Fields
/// - `patience`          — epochs without improvement before stopping; `None` never stops
/// - `metric_name`       — lookup key of the validation metric, sign stripped
/// - `higher_is_better`  — comparison direction, from the `+`/`-` prefix
/// - `history`           — one value per validated epoch
/// - `best_value`        — extremum of `history`
/// - `best_epoch`        — index of the earliest extremum in `history`
/// - `epochs_since_best` — `history.len() - 1 - best_epoch`
/// - `best_epoch_metrics`— validation metrics of the best epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrackerState {
    pub patience: Option<usize>,
    pub metric_name: String,
    pub higher_is_better: bool,
    pub history: Vec<f64>,
    pub best_value: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_since_best: usize,
    #[serde(default)]
    pub best_epoch_metrics: EpochMetrics,
}

/// Tracks a validation metric across epochs and decides early stopping.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTracker {
    state: MetricTrackerState,
}

impl MetricTracker {
    /// `validation_metric` must carry a direction prefix: `"+f1_measure"`
    /// (higher is better) or `"-loss"` (lower is better).
    pub fn new(patience: Option<usize>, validation_metric: &str) -> Result<MetricTracker, ConfigError> {
        let (higher_is_better, name) = if let Some(name) = validation_metric.strip_prefix('+') {
            (true, name)
        } else if let Some(name) = validation_metric.strip_prefix('-') {
            (false, name)
        } else {
            return Err(ConfigError::UnsignedValidationMetric(validation_metric.to_string()));
        };
        if name.is_empty() {
            return Err(ConfigError::UnsignedValidationMetric(validation_metric.to_string()));
        }
        Ok(MetricTracker {
            state: MetricTrackerState {
                patience,
                metric_name: name.to_string(),
                higher_is_better,
                history: Vec::new(),
                best_value: None,
                best_epoch: None,
                epochs_since_best: 0,
                best_epoch_metrics: EpochMetrics::new(),
            },
        })
    }

    pub fn metric_name(&self) -> &str {
        &self.state.metric_name
    }

    pub fn higher_is_better(&self) -> bool {
        self.state.higher_is_better
    }

    pub fn patience(&self) -> Option<usize> {
        self.state.patience
    }

    pub fn history(&self) -> &[f64] {
        &self.state.history
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.state.best_epoch
    }

    pub fn best_value(&self) -> Option<f64> {
        self.state.best_value
    }

    pub fn epochs_since_best(&self) -> usize {
        self.state.epochs_since_best
    }

    pub fn best_epoch_metrics(&self) -> &EpochMetrics {
        &self.state.best_epoch_metrics
    }

    pub fn set_best_epoch_metrics(&mut self, metrics: EpochMetrics) {
        self.state.best_epoch_metrics = metrics;
    }

    fn improves_on(&self, value: f64, best: f64) -> bool {
        if self.state.higher_is_better {
            value > best
        } else {
            value < best
        }
    }

    pub fn add_metric(&mut self, value: f64) {
        let improved = self.state.best_value.map_or(true, |best| self.improves_on(value, best));
        let state = &mut self.state;
        state.history.push(value);
        let epoch = state.history.len() - 1;
        if improved {
            state.best_value = Some(value);
            state.best_epoch = Some(epoch);
        }
        state.epochs_since_best = epoch - state.best_epoch.unwrap_or(epoch);
    }

    pub fn add_metrics(&mut self, values: impl IntoIterator<Item = f64>) {
        for value in values {
            self.add_metric(value);
        }
    }

    /// True when the latest value is strictly better than every earlier one,
    /// or is the first. An empty history also reports true.
    pub fn is_best_so_far(&self) -> bool {
        match self.state.history.len() {
            0 => true,
            n => self.state.best_epoch == Some(n - 1),
        }
    }

    pub fn should_stop_early(&self) -> bool {
        self.state.patience.is_some_and(|p| self.state.epochs_since_best >= p)
    }

    pub fn clear(&mut self) {
        self.state.history.clear();
        self.state.best_value = None;
        self.state.best_epoch = None;
        self.state.epochs_since_best = 0;
        self.state.best_epoch_metrics.clear();
    }

    pub fn state_dict(&self) -> MetricTrackerState {
        self.state.clone()
    }

    pub fn load_state_dict(&mut self, state: MetricTrackerState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unsigned_metric_name_is_rejected() {
        assert!(matches!(MetricTracker::new(None, "f1"), Err(ConfigError::UnsignedValidationMetric(_))));
        assert!(MetricTracker::new(None, "+").is_err());
        let tracker = MetricTracker::new(Some(2), "-loss").unwrap();
        assert_eq!(tracker.metric_name(), "loss");
        assert!(!tracker.higher_is_better());
    }

    #[test]
    fn empty_history_counts_as_best() {
        let tracker = MetricTracker::new(Some(1), "+acc").unwrap();
        assert!(tracker.is_best_so_far());
        assert!(!tracker.should_stop_early());
    }

    #[test]
    fn ties_keep_the_earliest_epoch() {
        let mut tracker = MetricTracker::new(Some(2), "+acc").unwrap();
        tracker.add_metrics([0.5, 0.7, 0.7]);
        assert_eq!(tracker.best_epoch(), Some(1));
        assert!(!tracker.is_best_so_far());
        assert_eq!(tracker.epochs_since_best(), 1);
    }

    #[test]
    fn lower_is_better_tracks_minimum() {
        let mut tracker = MetricTracker::new(Some(1), "-loss").unwrap();
        tracker.add_metrics([3.0, 2.0, 2.5]);
        assert_eq!(tracker.best_epoch(), Some(1));
        assert!(tracker.should_stop_early());
    }

    #[test]
    fn patience_reached_after_two_flat_epochs() {
        let mut tracker = MetricTracker::new(Some(2), "+f1_measure").unwrap();
        for (i, v) in [0.1, 0.2, 0.3, 0.3, 0.3].into_iter().enumerate() {
            tracker.add_metric(v);
            assert_eq!(tracker.should_stop_early(), i == 4);
        }
        assert_eq!(tracker.best_epoch(), Some(2));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut tracker = MetricTracker::new(Some(3), "+acc").unwrap();
        tracker.add_metrics([0.2, 0.4]);
        tracker.set_best_epoch_metrics(EpochMetrics::from([("acc".to_string(), 0.4)]));
        let json = serde_json::to_string(&tracker.state_dict()).unwrap();
        let mut restored = MetricTracker::new(None, "+other").unwrap();
        restored.load_state_dict(serde_json::from_str(&json).unwrap());
        assert_eq!(restored, tracker);
    }

    #[test]
    fn clear_resets_history() {
        let mut tracker = MetricTracker::new(Some(1), "+acc").unwrap();
        tracker.add_metrics([0.9, 0.1]);
        tracker.clear();
        assert!(tracker.history().is_empty());
        assert_eq!(tracker.best_epoch(), None);
        assert!(!tracker.should_stop_early());
    }

    proptest! {
        #[test]
        fn best_epoch_is_earliest_maximum(values in prop::collection::vec(-100i32..100, 1..40)) {
            let mut tracker = MetricTracker::new(None, "+m").unwrap();
            for (i, &v) in values.iter().enumerate() {
                let v = v as f64;
                let previous_max = values[..i].iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
                tracker.add_metric(v);

                let seen = &values[..=i];
                let max = *seen.iter().max().unwrap();
                let earliest = seen.iter().position(|&x| x == max).unwrap();
                prop_assert_eq!(tracker.best_epoch(), Some(earliest));
                prop_assert_eq!(tracker.epochs_since_best(), i - earliest);
                prop_assert_eq!(tracker.is_best_so_far(), i == 0 || v > previous_max);
            }
        }

        #[test]
        fn stop_iff_patience_reached(values in prop::collection::vec(0i32..10, 1..30), patience in 0usize..5) {
            let mut tracker = MetricTracker::new(Some(patience), "+m").unwrap();
            tracker.add_metrics(values.iter().map(|&v| v as f64));
            prop_assert_eq!(tracker.should_stop_early(), tracker.epochs_since_best() >= patience);

            let mut unbounded = MetricTracker::new(None, "+m").unwrap();
            unbounded.add_metrics(values.iter().map(|&v| v as f64));
            prop_assert!(!unbounded.should_stop_early());
        }
    }
}
