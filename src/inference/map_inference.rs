use std::time::Duration;

use log::debug;

use crate::{
    errors::{InferenceError, InferenceResult},
    fg::{factor_graph::FactorGraph, observation::FactorGraphObservation},
    inference::{mplp::Mplp, tree_max_product::TreeMaxProduct},
};

// Choice of MAP inference engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMethod {
    Auto,           // tree max-product on forests, MPLP otherwise
    TreeMaxProduct,
    LpRelaxation,   // MPLP dual decomposition
}

// How an inference run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStatus {
    Exact,          // tree max-product, no gap
    GapClosed,      // dual bound and best assignment within int_gap_thr
    Stalled,        // dual objective stopped improving before the gap closed
    IterationLimit,
    TimeLimit,
}

impl InferenceStatus {
    // Whether the returned assignment is optimal up to int_gap_thr
    pub fn is_converged(&self) -> bool {
        matches!(self, InferenceStatus::Exact | InferenceStatus::GapClosed)
    }
}

// Objectives after one MPLP sweep, in potentials (negated energies)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepRecord {
    pub iteration: usize,
    pub dual_objective: f64,           // upper bound on the maximal potential
    pub best_integral_objective: f64,  // potential of the best assignment decoded so far
}

// Result of MAP inference
#[derive(Debug, Clone, PartialEq)]
pub struct MapSolution {
    pub assignment: Vec<usize>,
    pub energy: f64,       // energy of `assignment`
    pub dual_bound: f64,   // lower bound on the minimal energy
    pub gap: f64,          // energy - dual_bound
    pub iterations: usize,
    pub status: InferenceStatus,
    pub trace: Vec<SweepRecord>,
}

impl MapSolution {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

#[derive(Debug, Clone)]
pub struct InferenceOptions {
    method: InferenceMethod,
    max_iterations: usize,
    time_max: Duration,
    int_gap_thr: f64,     // stop when the integrality gap drops below this value
    obj_del_thr: f64,     // stop when the dual objective improves less than this over the window
    obj_del_window: usize,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            method: InferenceMethod::Auto,
            max_iterations: 1000,
            time_max: Duration::new(20 * 60, 0), // 20 minutes
            int_gap_thr: 0.0002,
            obj_del_thr: 0.0002,
            obj_del_window: 1,
        }
    }
}

impl InferenceOptions {
    pub fn set_method(&mut self, value: InferenceMethod) -> &mut Self {
        self.method = value;
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

    pub fn set_int_gap_thr(&mut self, value: f64) -> &mut Self {
        self.int_gap_thr = value;
        self
    }

    pub fn set_obj_del_thr(&mut self, value: f64) -> &mut Self {
        self.obj_del_thr = value;
        self
    }

    pub fn set_obj_del_window(&mut self, value: usize) -> &mut Self {
        self.obj_del_window = value.max(1);
        self
    }

    pub fn method(&self) -> InferenceMethod {
        self.method
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn time_max(&self) -> Duration {
        self.time_max
    }

    pub fn int_gap_thr(&self) -> f64 {
        self.int_gap_thr
    }

    pub fn obj_del_thr(&self) -> f64 {
        self.obj_del_thr
    }

    pub fn obj_del_window(&self) -> usize {
        self.obj_del_window
    }
}

// A MAP inference engine bound to one factor graph
pub trait MapInference<'a>: Sized {
    fn init(graph: &'a FactorGraph) -> InferenceResult<Self>;
    fn run(self, options: &InferenceOptions) -> InferenceResult<MapSolution>;
}

// Engine selected for a graph
pub enum InferenceEngine<'a> {
    TreeMaxProduct(TreeMaxProduct<'a>),
    Mplp(Mplp<'a>),
}

impl<'a> InferenceEngine<'a> {
    // Picks the engine for `graph`; requires connect_components() since the last add_factor()
    pub fn for_graph(graph: &'a FactorGraph, method: InferenceMethod) -> InferenceResult<Self> {
        let use_tree = match method {
            InferenceMethod::Auto => graph.is_acyclic_graph()?,
            InferenceMethod::TreeMaxProduct => {
                if !graph.is_acyclic_graph()? {
                    return Err(InferenceError::NotATree);
                }
                true
            }
            InferenceMethod::LpRelaxation => false,
        };
        debug!(
            "Selected {} for a graph with {} factors",
            if use_tree { "tree max-product" } else { "MPLP" },
            graph.num_factors()
        );
        Ok(match use_tree {
            true => InferenceEngine::TreeMaxProduct(TreeMaxProduct::init(graph)?),
            false => InferenceEngine::Mplp(Mplp::init(graph)?),
        })
    }

    pub fn run(self, options: &InferenceOptions) -> InferenceResult<MapSolution> {
        match self {
            InferenceEngine::TreeMaxProduct(engine) => engine.run(options),
            InferenceEngine::Mplp(engine) => engine.run(options),
        }
    }
}

// Minimum-energy assignment of `graph` using its current energies
pub fn infer(graph: &FactorGraph, options: &InferenceOptions) -> InferenceResult<MapSolution> {
    InferenceEngine::for_graph(graph, options.method())?.run(options)
}

// Loss-augmented inference: augments a copy of `graph` against `observation` first.
// The returned energy is measured on the augmented energies.
pub fn infer_loss_augmented(
    graph: &FactorGraph,
    observation: &FactorGraphObservation,
    options: &InferenceOptions,
) -> InferenceResult<MapSolution> {
    let mut augmented = graph.clone();
    augmented.loss_augmentation(observation)?;
    infer(&augmented, options)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;

    use crate::factor_types::{factor::Factor, factor_type::FactorType};

    use super::*;

    fn end_to_end_graph() -> FactorGraph {
        let ftype = Arc::new(FactorType::new("pairwise", vec![2, 2], vec![]).unwrap());
        let w = [0.3, 0.5, 1.0, 0.2, 0.05, 0.6, -0.2, 0.75];
        let mut graph = FactorGraph::new(vec![2, 2, 2]);
        // the same type with two separately owned energy tables
        for (variables, energies) in [(vec![0, 1], &w[..4]), (vec![1, 2], &w[4..])] {
            let mut factor = Factor::new(ftype.clone(), variables, energies.to_vec().into()).unwrap();
            factor.compute_energies().unwrap();
            graph.add_factor(factor).unwrap();
        }
        graph.connect_components();
        graph
    }

    #[test]
    fn end_to_end_matches_brute_force() {
        let graph = end_to_end_graph();
        let (best_state, best_energy) = graph.brute_force_map().unwrap();

        for method in [
            InferenceMethod::Auto,
            InferenceMethod::TreeMaxProduct,
            InferenceMethod::LpRelaxation,
        ] {
            let mut options = InferenceOptions::default();
            options.set_method(method);
            let solution = infer(&graph, &options).unwrap();
            assert_eq!(solution.assignment, best_state);
            assert_abs_diff_eq!(solution.energy, best_energy, epsilon = 1e-9);
            assert!(solution.is_converged());
        }
    }

    #[test]
    fn auto_uses_tree_engine_on_chains() {
        let graph = end_to_end_graph();
        let solution = infer(&graph, &InferenceOptions::default()).unwrap();
        assert_eq!(solution.status, InferenceStatus::Exact);
        assert_eq!(solution.gap, 0.);
    }

    #[test]
    fn tree_engine_rejects_cycles() {
        let ftype = Arc::new(FactorType::new("pairwise", vec![2, 2], vec![0.; 4]).unwrap());
        let mut graph = FactorGraph::new(vec![2, 2, 2]);
        for variables in [vec![0, 1], vec![1, 2], vec![0, 2]] {
            graph.add_factor(Factor::independent(ftype.clone(), variables).unwrap()).unwrap();
        }
        let mut options = InferenceOptions::default();
        options.set_method(InferenceMethod::TreeMaxProduct);
        assert!(matches!(
            infer(&graph, &options),
            Err(InferenceError::Graph(_))
        ));
        graph.connect_components();
        assert!(matches!(infer(&graph, &options), Err(InferenceError::NotATree)));
    }

    #[test]
    fn loss_augmented_inference_moves_away_from_truth() {
        let unary = Arc::new(FactorType::new("unary", vec![2], vec![0., 0.4]).unwrap());
        let mut graph = FactorGraph::new(vec![2, 2]);
        graph.add_factor(Factor::independent(unary.clone(), vec![0]).unwrap()).unwrap();
        graph.add_factor(Factor::independent(unary, vec![1]).unwrap()).unwrap();
        graph.connect_components();

        let truth = FactorGraphObservation::with_loss_weights(vec![0, 0], vec![1., 0.1]).unwrap();
        let solution = infer_loss_augmented(&graph, &truth, &InferenceOptions::default()).unwrap();
        assert_eq!(solution.assignment, vec![1, 0]);
        assert_abs_diff_eq!(solution.energy, -0.6, epsilon = 1e-12);
    }
}
