use std::time::Duration;

use crate::{
    errors::{TrainingError, TrainingResult},
    inference::map_inference::{InferenceOptions, InferenceStatus},
    model::factor_graph_model::FactorGraphModel,
};

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    lambda: f64,                  // regularization constant
    max_iterations: usize,
    time_max: Duration,
    tol_rel: f64,
    tol_abs: f64,
    fail_fast: bool,              // abort on the first example whose inference does not converge
    inference_retries: usize,     // retries with a larger budget before an example is skipped
    retry_budget_factor: usize,   // budget multiplier applied on every retry
    parallel: bool,               // run batch inference on all examples in parallel
    seed: u64,
    objective_period: usize,      // objective_period = 0 means "never"
    buffer_size: usize,           // maximal number of cutting planes
    clean_icp: bool,              // remove inactive cutting planes
    clean_after: usize,           // iterations a plane may stay inactive before removal
    weighted_averaging: bool,
    gap_threshold: f64,
    line_search: bool,
    inference: InferenceOptions,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        TrainingOptions {
            lambda: 0.01,
            max_iterations: 100,
            time_max: Duration::new(20 * 60, 0), // 20 minutes
            tol_rel: 1e-3,
            tol_abs: 0.,
            fail_fast: false,
            inference_retries: 1,
            retry_budget_factor: 2,
            parallel: false,
            seed: 0,
            objective_period: 0,
            buffer_size: 1000,
            clean_icp: true,
            clean_after: 10,
            weighted_averaging: false,
            gap_threshold: 1e-4,
            line_search: true,
            inference: InferenceOptions::default(),
        }
    }
}

impl TrainingOptions {
    pub fn set_lambda(&mut self, value: f64) -> &mut Self {
        self.lambda = value;
        self
    }

    pub fn set_max_iterations(&mut self, value: usize) -> &mut Self {
        self.max_iterations = value;
        self
    }

    pub fn set_time_max(&mut self, value: Duration) -> &mut Self {
        self.time_max = value;
        self
    }

    pub fn set_tol_rel(&mut self, value: f64) -> &mut Self {
        self.tol_rel = value;
        self
    }

    pub fn set_tol_abs(&mut self, value: f64) -> &mut Self {
        self.tol_abs = value;
        self
    }

    pub fn set_fail_fast(&mut self, value: bool) -> &mut Self {
        self.fail_fast = value;
        self
    }

    pub fn set_inference_retries(&mut self, value: usize) -> &mut Self {
        self.inference_retries = value;
        self
    }

    pub fn set_retry_budget_factor(&mut self, value: usize) -> &mut Self {
        self.retry_budget_factor = value;
        self
    }

    pub fn set_parallel(&mut self, value: bool) -> &mut Self {
        self.parallel = value;
        self
    }

    pub fn set_seed(&mut self, value: u64) -> &mut Self {
        self.seed = value;
        self
    }

    pub fn set_objective_period(&mut self, value: usize) -> &mut Self {
        self.objective_period = value;
        self
    }

    pub fn set_buffer_size(&mut self, value: usize) -> &mut Self {
        self.buffer_size = value;
        self
    }

    pub fn set_clean_icp(&mut self, value: bool) -> &mut Self {
        self.clean_icp = value;
        self
    }

    pub fn set_clean_after(&mut self, value: usize) -> &mut Self {
        self.clean_after = value;
        self
    }

    pub fn set_weighted_averaging(&mut self, value: bool) -> &mut Self {
        self.weighted_averaging = value;
        self
    }

    pub fn set_gap_threshold(&mut self, value: f64) -> &mut Self {
        self.gap_threshold = value;
        self
    }

    pub fn set_line_search(&mut self, value: bool) -> &mut Self {
        self.line_search = value;
        self
    }

    pub fn set_inference(&mut self, value: InferenceOptions) -> &mut Self {
        self.inference = value;
        self
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn time_max(&self) -> Duration {
        self.time_max
    }

    pub fn tol_rel(&self) -> f64 {
        self.tol_rel
    }

    pub fn tol_abs(&self) -> f64 {
        self.tol_abs
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn inference_retries(&self) -> usize {
        self.inference_retries
    }

    pub fn retry_budget_factor(&self) -> usize {
        self.retry_budget_factor
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn objective_period(&self) -> usize {
        self.objective_period
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn clean_icp(&self) -> bool {
        self.clean_icp
    }

    pub fn clean_after(&self) -> usize {
        self.clean_after
    }

    pub fn weighted_averaging(&self) -> bool {
        self.weighted_averaging
    }

    pub fn gap_threshold(&self) -> f64 {
        self.gap_threshold
    }

    pub fn line_search(&self) -> bool {
        self.line_search
    }

    pub fn inference(&self) -> &InferenceOptions {
        &self.inference
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if !(self.lambda > 0.) {
            return Err(TrainingError::InvalidParameter(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if self.retry_budget_factor == 0 {
            return Err(TrainingError::InvalidParameter(
                "retry_budget_factor must be positive".to_string(),
            ));
        }
        if self.buffer_size < 2 {
            return Err(TrainingError::InvalidParameter(format!(
                "buffer_size must be at least 2, got {}",
                self.buffer_size
            )));
        }
        if self.tol_rel < 0. || self.tol_abs < 0. {
            return Err(TrainingError::InvalidParameter(
                "tolerances must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

// An example whose loss-augmented inference did not converge and was left out of an update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonConvergence {
    pub example: usize,
    pub iteration: usize,             // outer training iteration
    pub gap: f64,
    pub status: Option<InferenceStatus>, // None if no finite-energy assignment was found
}

// Why training stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStatus {
    Converged,
    IterationLimit,
    TimeLimit,
    BufferFull,
}

// Objectives recorded after one outer iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub primal: f64,
    pub dual: f64,
    pub w_distance: f64, // distance between consecutive weight vectors
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub w: Vec<f64>,
    pub iterations: usize,
    pub status: TrainingStatus,
    pub primal_objective: f64,
    pub history: Vec<IterationRecord>,
    pub skipped: Vec<NonConvergence>,
}

impl TrainingReport {
    pub fn is_converged(&self) -> bool {
        self.status == TrainingStatus::Converged
    }
}

// A structured-output learner over a factor graph model
pub trait StructuredSolver<'a>: Sized {
    fn init(model: &'a FactorGraphModel) -> TrainingResult<Self>;
    fn run(self, options: &TrainingOptions) -> TrainingResult<TrainingReport>;
}

pub(crate) fn squared_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

pub(crate) fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
