use bitvec::prelude::LocalBits;
use bitvec::vec::BitVec;
use log::debug;

use crate::{
    data_structures::graph_structure::GraphStructure,
    errors::{FactorGraphError, GraphResult},
    factor_types::factor::Factor,
    fg::observation::FactorGraphObservation,
};

// A collection of factors over a fixed set of discrete variables
#[derive(Debug, Clone)]
pub struct FactorGraph {
    cardinalities: Vec<usize>,            // number of states of every variable
    factors: Vec<Factor>,                 // factors in the order they were added
    num_edges: usize,                     // number of factor-variable incidences
    structure: Option<GraphStructure>,    // None until connect_components(), reset by add_factor()
}

impl FactorGraph {
    // Creates a graph without factors over variables with the given cardinalities
    pub fn new(cardinalities: Vec<usize>) -> Self {
        FactorGraph {
            cardinalities,
            factors: Vec::new(),
            num_edges: 0,
            structure: None,
        }
    }

    pub fn with_capacity(cardinalities: Vec<usize>, capacity: usize) -> Self {
        let mut graph = Self::new(cardinalities);
        graph.factors.reserve(capacity);
        graph
    }

    pub fn cardinalities(&self) -> &[usize] {
        &self.cardinalities
    }

    pub fn num_variables(&self) -> usize {
        self.cardinalities.len()
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    // Appends a factor and invalidates the connectivity structure
    pub fn add_factor(&mut self, factor: Factor) -> GraphResult<&mut Self> {
        let num_variables = self.num_variables();
        for (&variable, &factor_card) in factor
            .variables()
            .iter()
            .zip(factor.factor_type().get_cardinalities().iter())
        {
            let graph_card = *self.cardinalities.get(variable).ok_or(
                FactorGraphError::VariableOutOfRange {
                    index: variable,
                    num_variables,
                },
            )?;
            if graph_card != factor_card {
                return Err(FactorGraphError::CardinalityMismatch {
                    variable,
                    graph: graph_card,
                    factor: factor_card,
                });
            }
        }

        self.num_edges += factor.variables().len();
        self.factors.push(factor);
        self.structure = None;
        Ok(self)
    }

    // Recomputes connected components and the cycle flag from the current factors
    pub fn connect_components(&mut self) -> &GraphStructure {
        let structure = GraphStructure::analyze(self.num_variables(), &self.factors);
        debug!(
            "Graph with {} variables and {} factors: {} components, cycle: {}",
            self.num_variables(),
            self.factors.len(),
            structure.num_components(),
            structure.has_cycle()
        );
        self.structure.insert(structure)
    }

    // Connectivity structure, failing if factors were added since connect_components()
    pub fn structure(&self) -> GraphResult<&GraphStructure> {
        self.structure.as_ref().ok_or(FactorGraphError::StaleStructure)
    }

    pub fn is_acyclic_graph(&self) -> GraphResult<bool> {
        Ok(!self.structure()?.has_cycle())
    }

    pub fn is_connected_graph(&self) -> GraphResult<bool> {
        Ok(self.structure()?.num_components() == 1)
    }

    pub fn is_tree_graph(&self) -> GraphResult<bool> {
        Ok(self.is_acyclic_graph()? && self.is_connected_graph()?)
    }

    pub fn num_components(&self) -> GraphResult<usize> {
        Ok(self.structure()?.num_components())
    }

    // Recomputes the energy tables of all factors
    pub fn compute_energies(&mut self) -> GraphResult<()> {
        for factor in self.factors.iter_mut() {
            factor.compute_energies()?;
        }
        Ok(())
    }

    // Checks that `state` is a complete assignment of the graph's variables
    pub fn validate_assignment(&self, state: &[usize]) -> GraphResult<()> {
        if state.len() != self.num_variables() {
            return Err(FactorGraphError::AssignmentLength {
                expected: self.num_variables(),
                actual: state.len(),
            });
        }
        match state
            .iter()
            .zip(self.cardinalities.iter())
            .position(|(state, card)| state >= card)
        {
            Some(variable) => Err(FactorGraphError::StateOutOfRange {
                variable,
                state: state[variable],
                cardinality: self.cardinalities[variable],
            }),
            None => Ok(()),
        }
    }

    // Total energy of a full assignment
    pub fn evaluate_energy(&self, state: &[usize]) -> GraphResult<f64> {
        self.validate_assignment(state)?;
        self.factors
            .iter()
            .map(|factor| factor.evaluate_energy(state))
            .sum()
    }

    // Subtracts the loss weight of every variable from the energies of the first factor
    // containing it, at every joint state where the variable differs from the ground truth
    pub fn loss_augmentation(&mut self, observation: &FactorGraphObservation) -> GraphResult<()> {
        observation.validate(&self.cardinalities)?;

        let mut is_covered = BitVec::<usize, LocalBits>::repeat(false, self.num_variables());
        for factor in self.factors.iter() {
            for &variable in factor.variables().iter() {
                is_covered.set(variable, true);
            }
        }
        if let Some(variable) = is_covered.first_zero() {
            return Err(FactorGraphError::UnaugmentedVariable(variable));
        }

        let ground_truth = observation.states();
        let loss_weights = observation.loss_weights();
        let mut is_augmented = BitVec::<usize, LocalBits>::repeat(false, self.num_variables());
        for factor in self.factors.iter_mut() {
            let factor_type = factor.factor_type().clone();
            let variables = factor.variables().to_vec();
            for (position, &variable) in variables.iter().enumerate() {
                if is_augmented[variable] {
                    continue;
                }
                for ei in 0..factor_type.num_assignments() {
                    if factor_type.variable_state_from_index(ei, position) != ground_truth[variable] {
                        factor.shift_energy(ei, -loss_weights[variable]);
                    }
                }
                is_augmented.set(variable, true);
            }
        }
        Ok(())
    }

    // Exhaustive minimum-energy assignment; first minimum in enumeration order wins.
    // Only meant for graphs with a handful of variables.
    pub fn brute_force_map(&self) -> GraphResult<(Vec<usize>, f64)> {
        let mut state = vec![0; self.num_variables()];
        let mut best = (state.clone(), self.evaluate_energy(&state)?);
        loop {
            // Advance to the next assignment, first variable fastest
            let mut variable = 0;
            while variable < state.len() {
                state[variable] += 1;
                if state[variable] < self.cardinalities[variable] {
                    break;
                }
                state[variable] = 0;
                variable += 1;
            }
            if variable == state.len() {
                break;
            }
            let energy = self.evaluate_energy(&state)?;
            if energy < best.1 {
                best = (state.clone(), energy);
            }
        }
        Ok(best)
    }
}
