use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::error::{ExecutionError, ModelError};
use crate::loss::{LossGraph, ScalarLoss};
use crate::math::{Matrix, Parameter, StateDict};
use crate::model::{Mode, Model, ModelInput, ModelOutput};
use crate::optim::Optimizer;

/// Largest finite half-precision value; scaled gradients beyond it overflow.
const HALF_MAX: f64 = 65504.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How forward/backward/step are executed. Both options may be combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Scatter every batch across this many model replicas.
    #[serde(default)]
    pub data_parallel_replicas: Option<usize>,
    #[serde(default)]
    pub mixed_precision: Option<MixedPrecisionConfig>,
}

/// Dynamic loss scaling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    /// Successful steps before the scale grows again.
    pub growth_interval: usize,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        MixedPrecisionConfig { init_scale: 65536.0, growth_factor: 2.0, backoff_factor: 0.5, growth_interval: 2000 }
    }
}

// ---------------------------------------------------------------------------
// Loss scaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

/// Multiplies the loss before backward and divides the gradients after,
/// shrinking the scale whenever the scaled gradients overflow.
#[derive(Debug, Clone)]
pub struct LossScaler {
    config: MixedPrecisionConfig,
    state: LossScalerState,
    found_overflow: bool,
}

impl LossScaler {
    pub fn new(config: MixedPrecisionConfig) -> Result<LossScaler, ExecutionError> {
        let invalid = |reason: String| ExecutionError::Unavailable { strategy: "mixed precision", reason };
        if !(config.init_scale.is_finite() && config.init_scale > 0.0) {
            return Err(invalid(format!("loss scale {} must be positive and finite", config.init_scale)));
        }
        if !(config.growth_factor > 1.0) {
            return Err(invalid(format!("growth factor {} must exceed 1", config.growth_factor)));
        }
        if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
            return Err(invalid(format!("backoff factor {} must lie in (0, 1)", config.backoff_factor)));
        }
        let state = LossScalerState { scale: config.init_scale, growth_tracker: 0 };
        Ok(LossScaler { config, state, found_overflow: false })
    }

    pub fn scale(&self) -> f64 {
        self.state.scale
    }

    pub fn state(&self) -> &LossScalerState {
        &self.state
    }

    pub fn load_state(&mut self, state: LossScalerState) {
        self.state = state;
        self.found_overflow = false;
    }

    /// Divides scaled gradients by the current scale, noting any overflow.
    fn unscale(&mut self, params: &mut [&mut Parameter]) {
        let inv = 1.0 / self.state.scale;
        for p in params.iter_mut() {
            if p.grad.data.iter().any(|g| !g.is_finite() || g.abs() > HALF_MAX) {
                self.found_overflow = true;
            }
            p.grad.scale(inv);
        }
    }

    /// Advances the scale after a backward pass. Returns false when the
    /// step must be skipped.
    fn update(&mut self) -> bool {
        if std::mem::take(&mut self.found_overflow) {
            self.state.scale *= self.config.backoff_factor;
            self.state.growth_tracker = 0;
            warn!(scale = self.state.scale, "gradient overflow; skipping step and reducing loss scale");
            return false;
        }
        self.state.growth_tracker += 1;
        if self.state.growth_tracker >= self.config.growth_interval {
            self.state.scale *= self.config.growth_factor;
            self.state.growth_tracker = 0;
        }
        true
    }
}

/// Whether [`ExecutionStrategy::step`] updated the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied,
    Skipped { scale: f64 },
}

// ---------------------------------------------------------------------------
// Data parallel
// ---------------------------------------------------------------------------

struct DataParallel<M> {
    pool: ThreadPool,
    replicas: Vec<M>,
    /// Row ranges scattered in the last training forward.
    chunks: Vec<(usize, usize)>,
}

fn sync_weights<M: Model>(replica: &mut M, primary: &M) {
    for (r, p) in replica.parameters_mut().into_iter().zip(primary.parameters()) {
        r.value.clone_from(&p.value);
    }
}

fn scatter(batch_size: usize, replicas: usize) -> Vec<(usize, usize)> {
    let parts = replicas.min(batch_size).max(1);
    let chunk = batch_size.div_ceil(parts).max(1);
    (0..batch_size).step_by(chunk).map(|start| (start, (start + chunk).min(batch_size))).collect()
}

impl<M: Model> DataParallel<M> {
    fn forward(
        &mut self,
        primary: &M,
        input: &ModelInput<'_>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<ModelOutput, ModelError> {
        let batch_size = input.batch_size();
        let ranges = scatter(batch_size, self.replicas.len());
        let masks: Vec<Matrix> = ranges.iter().map(|&(s, e)| input.mask.slice_rows(s, e)).collect();
        let seeds: Vec<u64> = ranges.iter().map(|_| rng.gen()).collect();
        for replica in &mut self.replicas[..ranges.len()] {
            sync_weights(replica, primary);
            replica.zero_grad();
        }

        let DataParallel { pool, replicas, .. } = &mut *self;
        let results: Vec<Result<ModelOutput, ModelError>> = pool.install(|| {
            replicas
                .par_iter_mut()
                .zip(ranges.par_iter().zip(masks.par_iter().zip(seeds.par_iter())))
                .map(|(replica, (&(s, e), (mask, &seed)))| {
                    let chunk = ModelInput {
                        tokens: &input.tokens[s..e],
                        lengths: input.lengths.map(|l| &l[s..e]),
                        mask,
                        labels: input.labels.map(|l| &l[s..e]),
                    };
                    replica.forward(&chunk, mode, &mut StdRng::seed_from_u64(seed))
                })
                .collect()
        });
        let outputs = results.into_iter().collect::<Result<Vec<_>, _>>()?;

        let logits = Matrix::vstack(&outputs.iter().map(|o| o.logits.clone()).collect::<Vec<_>>());
        let loss = outputs.iter().map(|o| o.loss.as_ref()).collect::<Option<Vec<_>>>().map(|losses| {
            // Mean over the whole batch: weight each chunk by its share of rows.
            let mut value = 0.0;
            let mut grads = Vec::with_capacity(losses.len());
            for (loss, &(s, e)) in losses.iter().zip(&ranges) {
                let weight = (e - s) as f64 / batch_size as f64;
                value += weight * loss.value;
                let mut grad = loss.logits_grad.clone();
                grad.scale(weight);
                grads.push(grad);
            }
            ScalarLoss { value, logits_grad: Matrix::vstack(&grads) }
        });
        let first = outputs.first().ok_or_else(|| ModelError::InvalidInput("empty batch".to_string()))?;
        let output = ModelOutput {
            logits,
            loss,
            coefficient: first.coefficient,
            regularization_loss: first.regularization_loss,
        };
        self.chunks = if mode.is_training() { ranges } else { Vec::new() };
        Ok(output)
    }

    fn backward(&mut self, primary: &mut M, graph: &LossGraph) -> Result<(), ModelError> {
        let chunks = std::mem::take(&mut self.chunks);
        let Some(&(_, end)) = chunks.last() else {
            return Err(ModelError::NoForwardCache);
        };
        if graph.logits_grad.rows != end {
            return Err(ModelError::Shape {
                context: "data parallel logits gradient".to_string(),
                expected: (end, graph.logits_grad.cols),
                actual: graph.logits_grad.shape(),
            });
        }
        // The regularization gradient is added once, by the first replica.
        let graphs: Vec<LossGraph> =
            chunks.iter().enumerate().map(|(i, &(s, e))| graph.slice_rows(s, e, i == 0)).collect();

        let DataParallel { pool, replicas, .. } = &mut *self;
        let results: Vec<Result<(), ModelError>> = pool.install(|| {
            replicas.par_iter_mut().zip(graphs.par_iter()).map(|(replica, g)| replica.backward(g)).collect()
        });
        results.into_iter().collect::<Result<(), _>>()?;

        for replica in &replicas[..chunks.len()] {
            for (p, r) in primary.parameters_mut().into_iter().zip(replica.parameters()) {
                p.accumulate_grad(&r.grad);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Wraps the model being trained and decides how each batch is executed.
///
/// The wrapped model is always the one checkpointed; replicas only ever
/// hold copies of its weights.
pub struct ExecutionStrategy<M> {
    model: M,
    data_parallel: Option<DataParallel<M>>,
    scaler: Option<LossScaler>,
}

impl<M: Model + Clone> ExecutionStrategy<M> {
    pub fn single_device(model: M) -> ExecutionStrategy<M> {
        ExecutionStrategy { model, data_parallel: None, scaler: None }
    }

    /// Fails when the requested acceleration cannot be set up.
    pub fn new(model: M, config: &ExecutionConfig) -> Result<ExecutionStrategy<M>, ExecutionError> {
        let data_parallel = match config.data_parallel_replicas {
            None => None,
            Some(0) => {
                return Err(ExecutionError::Unavailable {
                    strategy: "data parallel",
                    reason: "at least one replica is required".to_string(),
                })
            }
            Some(n) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("replica-{i}"))
                    .build()
                    .map_err(|e| ExecutionError::Unavailable { strategy: "data parallel", reason: e.to_string() })?;
                let replicas = (0..n).map(|_| model.clone()).collect();
                Some(DataParallel { pool, replicas, chunks: Vec::new() })
            }
        };

        let scaler = match &config.mixed_precision {
            None => None,
            Some(_) if !model.supports_mixed_precision() => {
                return Err(ExecutionError::Unavailable {
                    strategy: "mixed precision",
                    reason: "the model does not support reduced precision".to_string(),
                })
            }
            Some(mp) => Some(LossScaler::new(mp.clone())?),
        };

        let strategy = ExecutionStrategy { model, data_parallel, scaler };
        info!("execution strategy: {}", strategy.describe());
        Ok(strategy)
    }
}

impl<M: Model> ExecutionStrategy<M> {
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        match &self.data_parallel {
            Some(dp) => parts.push(format!("data parallel x{}", dp.replicas.len())),
            None => parts.push("single device".to_string()),
        }
        if self.scaler.is_some() {
            parts.push("mixed precision".to_string());
        }
        parts.join(" + ")
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn forward(&mut self, input: &ModelInput<'_>, mode: Mode, rng: &mut StdRng) -> Result<ModelOutput, ModelError> {
        let mut output = match &mut self.data_parallel {
            Some(dp) => dp.forward(&self.model, input, mode, rng)?,
            None => self.model.forward(input, mode, rng)?,
        };
        if self.scaler.is_some() {
            output.logits.map_inplace(|x| x as f32 as f64);
        }
        Ok(output)
    }

    /// Backpropagates `graph` into the wrapped model's gradients. Under mixed
    /// precision the loss is scaled first and the gradients unscaled after.
    ///
    /// Registered gradient clamps apply to the summed gradient, after every
    /// contribution (model terms, replicas) has been accumulated and before
    /// unscaling.
    pub fn backward(&mut self, graph: &LossGraph) -> Result<(), ModelError> {
        let scaled;
        let graph = match &self.scaler {
            Some(scaler) => {
                scaled = graph.scaled(scaler.scale());
                &scaled
            }
            None => graph,
        };
        match &mut self.data_parallel {
            Some(dp) => dp.backward(&mut self.model, graph)?,
            None => self.model.backward(graph)?,
        }
        for p in self.model.parameters_mut() {
            p.clamp_grad();
        }
        if let Some(scaler) = &mut self.scaler {
            scaler.unscale(&mut self.model.parameters_mut());
        }
        Ok(())
    }

    pub fn step(&mut self, optimizer: &mut dyn Optimizer) -> StepOutcome {
        if let Some(scaler) = &mut self.scaler {
            if !scaler.update() {
                self.model.zero_grad();
                return StepOutcome::Skipped { scale: scaler.scale() };
            }
        }
        optimizer.step(&mut self.model.parameters_mut());
        StepOutcome::Applied
    }

    pub fn zero_grad(&mut self) {
        self.model.zero_grad();
        if let Some(dp) = &mut self.data_parallel {
            for replica in &mut dp.replicas {
                replica.zero_grad();
            }
        }
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.model.parameters()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.model.parameters_mut()
    }

    pub fn state_dict(&self) -> StateDict {
        self.model.state_dict()
    }

    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        self.model.load_state_dict(state)
    }

    pub fn loss_scaler_state(&self) -> Option<LossScalerState> {
        self.scaler.as_ref().map(|s| s.state().clone())
    }

    pub fn load_loss_scaler_state(&mut self, state: Option<LossScalerState>) {
        if let (Some(scaler), Some(state)) = (&mut self.scaler, state) {
            scaler.load_state(state);
        }
    }
}
