use std::sync::Arc;

use log::{debug, warn};
use ndarray::ArrayView1;
use rayon::prelude::*;

use crate::{
    errors::{FactorGraphError, GraphResult, InferenceError, TrainingError, TrainingResult},
    factor_types::factor_type::FactorType,
    fg::{factor_graph::FactorGraph, observation::FactorGraphObservation},
    inference::map_inference::{infer, InferenceOptions, InferenceStatus},
    solvers::solver::{NonConvergence, TrainingOptions},
};

// Multiplies the iteration cap, the time cap and the stall window by `factor`.
// A stalled run only gets further with a longer improvement window.
fn enlarge_budget(inference: &mut InferenceOptions, factor: usize) {
    let max_iterations = inference.max_iterations().saturating_mul(factor);
    let time_max = inference
        .time_max()
        .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX));
    let obj_del_window = inference.obj_del_window().saturating_mul(factor);
    inference
        .set_max_iterations(max_iterations)
        .set_time_max(time_max)
        .set_obj_del_window(obj_del_window);
}

// A training example: one factor graph and its ground-truth labeling
#[derive(Debug, Clone)]
pub struct Example {
    pub graph: FactorGraph,
    pub truth: FactorGraphObservation,
}

// Outcome of (loss-augmented) inference on one example
#[derive(Debug, Clone, PartialEq)]
pub struct ArgmaxResult {
    pub prediction: Vec<usize>,
    pub psi_pred: Vec<f64>,
    pub psi_truth: Vec<f64>,
    pub delta: f64,   // loss of the prediction against the ground truth
    pub score: f64,   // delta + <w, psi_pred> - <w, psi_truth>
    pub status: InferenceStatus,
    pub gap: f64,
}

impl ArgmaxResult {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

#[derive(Debug, Clone)]
pub enum ArgmaxOutcome {
    Converged(ArgmaxResult),
    Skipped(NonConvergence),
}

// Averaged structured hinge loss and one of its subgradients
#[derive(Debug, Clone)]
pub struct Risk {
    pub value: f64,
    pub subgradient: Vec<f64>,
    pub skipped: Vec<NonConvergence>,
}

// Structured model over factor graphs. Every registered factor type owns a contiguous
// block of the global parameter vector, in registration order.
#[derive(Debug, Default)]
pub struct FactorGraphModel {
    factor_types: Vec<Arc<FactorType>>,
    param_offsets: Vec<usize>,
    dim: usize,
    examples: Vec<Example>,
}

impl FactorGraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    // Registers a factor type; its current weights define the size of its parameter block
    pub fn add_factor_type(&mut self, factor_type: Arc<FactorType>) -> GraphResult<&mut Self> {
        if self.offset_of(factor_type.type_id()).is_some() {
            return Err(FactorGraphError::DataSize {
                type_id: factor_type.type_id().to_string(),
                message: "a factor type with this id is already registered".to_string(),
            });
        }
        if factor_type.num_params() == 0 {
            return Err(FactorGraphError::DataSize {
                type_id: factor_type.type_id().to_string(),
                message: "factor type has no parameters".to_string(),
            });
        }
        self.param_offsets.push(self.dim);
        self.dim += factor_type.num_params();
        self.factor_types.push(factor_type);
        Ok(self)
    }

    // Unregisters a factor type and shifts the parameter blocks after it
    pub fn del_factor_type(&mut self, type_id: &str) -> GraphResult<Arc<FactorType>> {
        let position = self
            .factor_types
            .iter()
            .position(|ftype| ftype.type_id() == type_id)
            .ok_or_else(|| FactorGraphError::UnknownFactorType(type_id.to_string()))?;
        let removed = self.factor_types.remove(position);
        self.param_offsets.clear();
        self.dim = 0;
        for ftype in self.factor_types.iter() {
            self.param_offsets.push(self.dim);
            self.dim += ftype.num_params();
        }
        Ok(removed)
    }

    pub fn factor_types(&self) -> &[Arc<FactorType>] {
        &self.factor_types
    }

    fn offset_of(&self, type_id: &str) -> Option<usize> {
        self.factor_types
            .iter()
            .position(|ftype| ftype.type_id() == type_id)
            .map(|position| self.param_offsets[position])
    }

    // Dimension of the global parameter vector
    pub fn dim(&self) -> usize {
        self.dim
    }

    // Adds a training example; every factor must use a registered type
    pub fn add_example(
        &mut self,
        mut graph: FactorGraph,
        truth: FactorGraphObservation,
    ) -> GraphResult<&mut Self> {
        truth.validate(graph.cardinalities())?;
        for factor in graph.factors().iter() {
            let type_id = factor.factor_type().type_id();
            if self.offset_of(type_id).is_none() {
                return Err(FactorGraphError::UnknownFactorType(type_id.to_string()));
            }
        }
        graph.connect_components();
        self.examples.push(Example { graph, truth });
        Ok(self)
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }

    // Pushes a global parameter vector into the factor types
    pub fn w_to_fparams(&self, w: &[f64]) -> GraphResult<()> {
        if w.len() != self.dim {
            return Err(FactorGraphError::WeightLength {
                expected: self.dim,
                actual: w.len(),
            });
        }
        for (ftype, &offset) in self.factor_types.iter().zip(self.param_offsets.iter()) {
            ftype.set_w(w[offset..offset + ftype.num_params()].to_vec())?;
        }
        Ok(())
    }

    // Collects the factor types' weights into a global parameter vector
    pub fn fparams_to_w(&self) -> Vec<f64> {
        let mut w = Vec::with_capacity(self.dim);
        for ftype in self.factor_types.iter() {
            w.extend_from_slice(&ftype.get_w());
        }
        w
    }

    // ψ(x_i, y), negated so that <w, ψ(x_i, y)> = -E(y)
    pub fn joint_feature_vector(&self, example: usize, states: &[usize]) -> GraphResult<Vec<f64>> {
        let graph = &self.examples[example].graph;
        graph.validate_assignment(states)?;
        let mut psi = vec![0.; self.dim];
        for factor in graph.factors().iter() {
            let ftype = factor.factor_type();
            let offset = self
                .offset_of(ftype.type_id())
                .ok_or_else(|| FactorGraphError::UnknownFactorType(ftype.type_id().to_string()))?;
            let ei = ftype.index_from_universe_assignment(states, factor.variables());
            factor.add_state_gradient(ei, -1., &mut psi, offset);
        }
        Ok(psi)
    }

    // Weighted Hamming loss of a prediction on example `example`
    pub fn delta_loss(&self, example: usize, prediction: &[usize]) -> GraphResult<f64> {
        self.examples[example].truth.hamming_loss(prediction)
    }

    // Inference on one example with the weights currently held by the factor types.
    // `w` must be the vector last pushed by w_to_fparams(); it is only used for the score.
    pub fn argmax_current(
        &self,
        w: &[f64],
        example: usize,
        training: bool,
        options: &InferenceOptions,
    ) -> TrainingResult<ArgmaxResult> {
        let Example { graph, truth } = &self.examples[example];
        let mut graph = graph.clone();
        graph.compute_energies()?;
        if training {
            graph.loss_augmentation(truth)?;
        }
        let solution = infer(&graph, options)?;

        let psi_pred = self.joint_feature_vector(example, &solution.assignment)?;
        let psi_truth = self.joint_feature_vector(example, truth.states())?;
        let delta = if training {
            self.delta_loss(example, &solution.assignment)?
        } else {
            0.
        };
        let w_view = ArrayView1::from(w);
        let score = delta + w_view.dot(&ArrayView1::from(&psi_pred[..]))
            - w_view.dot(&ArrayView1::from(&psi_truth[..]));

        Ok(ArgmaxResult {
            prediction: solution.assignment,
            psi_pred,
            psi_truth,
            delta,
            score,
            status: solution.status,
            gap: solution.gap,
        })
    }

    // Pushes `w` into the factor types, then runs inference on one example
    pub fn argmax(
        &self,
        w: &[f64],
        example: usize,
        training: bool,
        options: &InferenceOptions,
    ) -> TrainingResult<ArgmaxResult> {
        self.w_to_fparams(w)?;
        self.argmax_current(w, example, training, options)
    }

    // Loss-augmented inference that retries non-converged runs with a larger budget and
    // skips the example (or fails in fail-fast mode) if it still does not converge
    pub fn argmax_checked(
        &self,
        w: &[f64],
        example: usize,
        iteration: usize,
        options: &TrainingOptions,
    ) -> TrainingResult<ArgmaxOutcome> {
        let mut inference = options.inference().clone();
        let mut attempt = 0;
        loop {
            let (status, gap) = match self.argmax_current(w, example, true, &inference) {
                Ok(result) if result.is_converged() => return Ok(ArgmaxOutcome::Converged(result)),
                Ok(result) => (Some(result.status), result.gap),
                Err(TrainingError::Inference(InferenceError::NoFiniteEnergy { .. })) => {
                    (None, f64::INFINITY)
                }
                Err(error) => return Err(error),
            };

            if attempt >= options.inference_retries() {
                if options.fail_fast() {
                    return Err(TrainingError::NonConvergence { example, gap });
                }
                warn!(
                    "Inference on example {} did not converge (gap {}). Skipping it in iteration {}.",
                    example, gap, iteration
                );
                return Ok(ArgmaxOutcome::Skipped(NonConvergence {
                    example,
                    iteration,
                    gap,
                    status,
                }));
            }

            attempt += 1;
            enlarge_budget(&mut inference, options.retry_budget_factor());
            debug!(
                "Retrying inference on example {} with {} iterations",
                example,
                inference.max_iterations()
            );
        }
    }

    // Loss-augmented inference on every example with the current factor type weights
    pub fn argmax_all(
        &self,
        w: &[f64],
        iteration: usize,
        options: &TrainingOptions,
    ) -> TrainingResult<Vec<ArgmaxOutcome>> {
        if options.parallel() {
            (0..self.examples.len())
                .into_par_iter()
                .map(|example| self.argmax_checked(w, example, iteration, options))
                .collect()
        } else {
            (0..self.examples.len())
                .map(|example| self.argmax_checked(w, example, iteration, options))
                .collect()
        }
    }

    // R(w) = 1/N Σ_i max_y [Δ(y_i, y) + <w, ψ(x_i, y)> - <w, ψ(x_i, y_i)>] and a subgradient.
    // Skipped examples contribute nothing.
    pub fn risk(&self, w: &[f64], iteration: usize, options: &TrainingOptions) -> TrainingResult<Risk> {
        if self.examples.is_empty() {
            return Err(TrainingError::EmptyModel);
        }
        self.w_to_fparams(w)?;

        let scale = 1. / self.examples.len() as f64;
        let mut risk = Risk {
            value: 0.,
            subgradient: vec![0.; self.dim],
            skipped: Vec::new(),
        };
        for outcome in self.argmax_all(w, iteration, options)? {
            match outcome {
                ArgmaxOutcome::Converged(result) => {
                    risk.value += scale * result.score;
                    for ((g, pred), truth) in risk
                        .subgradient
                        .iter_mut()
                        .zip(result.psi_pred.iter())
                        .zip(result.psi_truth.iter())
                    {
                        *g += scale * (pred - truth);
                    }
                }
                ArgmaxOutcome::Skipped(record) => risk.skipped.push(record),
            }
        }
        Ok(risk)
    }

    // Predicted labeling of every example
    pub fn predict(&self, w: &[f64], options: &InferenceOptions) -> TrainingResult<Vec<Vec<usize>>> {
        self.w_to_fparams(w)?;
        (0..self.examples.len())
            .map(|example| {
                self.argmax_current(w, example, false, options)
                    .map(|result| result.prediction)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use approx::assert_abs_diff_eq;

    use crate::factor_types::factor::Factor;

    use super::*;

    // Two variables, one data-dependent unary type and one data-independent pairwise type
    fn small_model() -> FactorGraphModel {
        let unary = Arc::new(FactorType::with_data_size("unary", vec![2], 2).unwrap());
        let pairwise = Arc::new(FactorType::with_data_size("pairwise", vec![2, 2], 1).unwrap());
        let mut model = FactorGraphModel::new();
        model.add_factor_type(unary.clone()).unwrap();
        model.add_factor_type(pairwise.clone()).unwrap();

        for (features, labels) in [([1., 0.5], vec![0, 1]), ([-1., 2.], vec![1, 1])] {
            let mut graph = FactorGraph::new(vec![2, 2]);
            for variable in 0..2 {
                graph
                    .add_factor(Factor::new(unary.clone(), vec![variable], features.to_vec().into()).unwrap())
                    .unwrap();
            }
            graph
                .add_factor(Factor::independent(pairwise.clone(), vec![0, 1]).unwrap())
                .unwrap();
            model.add_example(graph, FactorGraphObservation::new(labels)).unwrap();
        }
        model
    }

    #[test]
    fn parameter_layout() {
        let mut model = small_model();
        assert_eq!(model.dim(), 8);
        let w = (0..8).map(|k| k as f64).collect::<Vec<_>>();
        model.w_to_fparams(&w).unwrap();
        assert_eq!(model.factor_types()[1].get_w().as_ref(), &[4., 5., 6., 7.]);
        assert_eq!(model.fparams_to_w(), w);
        assert!(model.w_to_fparams(&w[..7]).is_err());

        model.del_factor_type("unary").unwrap();
        assert_eq!(model.dim(), 4);
        assert!(model.del_factor_type("unary").is_err());
    }

    #[test]
    fn joint_feature_vector_scores_negative_energy() {
        let model = small_model();
        let w = vec![0.3, -0.2, 0.7, 0.1, 0.05, -0.4, 0.6, 0.25];
        model.w_to_fparams(&w).unwrap();

        let mut graph = model.examples()[0].graph.clone();
        graph.compute_energies().unwrap();
        for ei in 0..4 {
            let states = vec![ei & 1, ei >> 1];
            let psi = model.joint_feature_vector(0, &states).unwrap();
            let score = w.iter().zip(psi.iter()).map(|(a, b)| a * b).sum::<f64>();
            assert_abs_diff_eq!(score, -graph.evaluate_energy(&states).unwrap(), epsilon = 1e-12);
        }
    }

    #[test]
    fn argmax_score_matches_definition() {
        let model = small_model();
        let w = vec![0.3, -0.2, 0.7, 0.1, 0.05, -0.4, 0.6, 0.25];
        let result = model.argmax(&w, 1, true, &InferenceOptions::default()).unwrap();

        let dot = |psi: &[f64]| w.iter().zip(psi.iter()).map(|(a, b)| a * b).sum::<f64>();
        let delta = model.delta_loss(1, &result.prediction).unwrap();
        assert_abs_diff_eq!(result.delta, delta);
        assert_abs_diff_eq!(
            result.score,
            delta + dot(&result.psi_pred) - dot(&result.psi_truth),
            epsilon = 1e-12
        );
        // the loss-augmented maximizer scores at least as high as the ground truth
        assert!(result.score >= -1e-12);
        assert_eq!(result.status, InferenceStatus::Exact);
    }

    #[test]
    fn risk_is_parallel_invariant() {
        let model = small_model();
        let w = vec![0.3, -0.2, 0.7, 0.1, 0.05, -0.4, 0.6, 0.25];
        let mut options = TrainingOptions::default();
        let sequential = model.risk(&w, 0, &options).unwrap();
        options.set_parallel(true);
        let parallel = model.risk(&w, 0, &options).unwrap();
        assert_eq!(sequential.value, parallel.value);
        assert_eq!(sequential.subgradient, parallel.subgradient);
        assert!(sequential.skipped.is_empty());
    }

    #[test]
    fn zero_weights_have_unit_risk() {
        let model = small_model();
        let risk = model.risk(&vec![0.; 8], 0, &TrainingOptions::default()).unwrap();
        // every labeling has zero energy, so the loss-augmented maximizer flips all labels
        assert_abs_diff_eq!(risk.value, 1., epsilon = 1e-12);
    }

    // One example on three variables that all want to differ, which the relaxation cannot decide
    fn frustrated_model() -> FactorGraphModel {
        let differ = Arc::new(FactorType::new("differ", vec![2, 2], vec![1., 0., 0., 1.]).unwrap());
        let mut model = FactorGraphModel::new();
        model.add_factor_type(differ.clone()).unwrap();
        let mut graph = FactorGraph::new(vec![2; 3]);
        for variables in [vec![0, 1], vec![1, 2], vec![0, 2]] {
            graph.add_factor(Factor::independent(differ.clone(), variables).unwrap()).unwrap();
        }
        model.add_example(graph, FactorGraphObservation::new(vec![0; 3])).unwrap();
        model
    }

    #[test]
    fn unconverged_inference_is_skipped() {
        let model = frustrated_model();
        let w = model.fparams_to_w();
        let options = TrainingOptions::default();

        match model.argmax_checked(&w, 0, 4, &options).unwrap() {
            ArgmaxOutcome::Skipped(record) => {
                assert_eq!(record.example, 0);
                assert_eq!(record.iteration, 4);
                assert!(record.gap > options.inference().int_gap_thr());
                assert!(matches!(
                    record.status,
                    Some(InferenceStatus::Stalled) | Some(InferenceStatus::IterationLimit)
                ));
            }
            ArgmaxOutcome::Converged(result) => {
                panic!("inference reported convergence with status {:?}", result.status)
            }
        }

        let risk = model.risk(&w, 4, &options).unwrap();
        assert_eq!(risk.value, 0.);
        assert!(risk.subgradient.iter().all(|&g| g == 0.));
        assert_eq!(risk.skipped.len(), 1);
    }

    #[test]
    fn retry_budget_saturates() {
        let mut inference = InferenceOptions::default();
        inference.set_time_max(Duration::new(10, 0)).set_obj_del_window(3);
        enlarge_budget(&mut inference, 4);
        assert_eq!(inference.max_iterations(), 4000);
        assert_eq!(inference.time_max(), Duration::new(40, 0));
        assert_eq!(inference.obj_del_window(), 12);

        // a factor beyond u32 must not wrap around to a smaller time cap
        let factor = u32::MAX as usize + 2;
        let mut inference = InferenceOptions::default();
        inference.set_time_max(Duration::new(1, 0));
        enlarge_budget(&mut inference, factor);
        assert_eq!(inference.time_max(), Duration::new(u32::MAX as u64, 0));
        assert_eq!(inference.max_iterations(), 1000 * factor);
    }

    #[test]
    fn fail_fast_reports_the_example() {
        let model = frustrated_model();
        let w = model.fparams_to_w();
        let mut options = TrainingOptions::default();
        options.set_fail_fast(true).set_inference_retries(0);

        assert!(matches!(
            model.argmax_checked(&w, 0, 1, &options),
            Err(TrainingError::NonConvergence { example: 0, .. })
        ));
        assert!(matches!(
            model.risk(&w, 1, &options),
            Err(TrainingError::NonConvergence { example: 0, .. })
        ));
    }

    #[test]
    fn unknown_factor_types_are_rejected() {
        let mut model = FactorGraphModel::new();
        let ftype = Arc::new(FactorType::new("unary", vec![2], vec![0., 0.]).unwrap());
        let mut graph = FactorGraph::new(vec![2]);
        graph.add_factor(Factor::independent(ftype.clone(), vec![0]).unwrap()).unwrap();
        assert!(model
            .add_example(graph.clone(), FactorGraphObservation::new(vec![0]))
            .is_err());
        model.add_factor_type(ftype.clone()).unwrap();
        assert!(model.add_factor_type(ftype).is_err());
        assert!(model.add_example(graph, FactorGraphObservation::new(vec![0])).is_ok());
        assert!(matches!(
            FactorGraphModel::new().risk(&[], 0, &TrainingOptions::default()),
            Err(TrainingError::EmptyModel)
        ));
    }
}
