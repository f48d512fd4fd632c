use std::time::Instant;

use log::{debug, info};

use crate::{
    errors::{InferenceError, InferenceResult},
    fg::factor_graph::FactorGraph,
    inference::{
        map_inference::{
            InferenceOptions, InferenceStatus, MapInference, MapSolution, SweepRecord,
        },
        mplp_regions::RegionGraph,
    },
};

const MAX_REFINE_PASSES: usize = 100;

// MPLP dual decomposition over the LP relaxation of MAP inference.
//
// Works on potentials θ = -E. Every sweep updates the regions in factor order; a region
// max-marginalizes its potential plus the messages other regions sent to its intersection
// sets and gives each set an equal share of the result. The dual objective never increases
// and bounds the potential of every assignment from above.
// Candidates are decoded from the singleton beliefs and improved by conditional modes.
pub struct Mplp<'a> {
    graph: &'a FactorGraph,
    regions: RegionGraph,
    variable_factors: Vec<Vec<usize>>, // factors containing each variable
    lam_minus: Vec<Vec<f64>>,          // scratch: messages from other regions, per slot
    total: Vec<f64>,                   // scratch: region potential plus incoming messages
    max_marginal: Vec<f64>,            // scratch
}

impl<'a> Mplp<'a> {
    // Updates all messages sent by one region
    fn update_region(&mut self, region_index: usize) {
        let num_slots = self.regions.regions[region_index].intersections.len();
        self.lam_minus.resize(num_slots, Vec::new());
        for slot in 0..num_slots {
            let set = self.regions.regions[region_index].intersections[slot];
            self.regions
                .messages_from_others(set, region_index, &mut self.lam_minus[slot]);
        }

        let region = &self.regions.regions[region_index];
        self.total.clear();
        self.total.extend_from_slice(&region.potentials);
        for (lam_minus, index_map) in self.lam_minus.iter().zip(region.index_maps.iter()) {
            for (value, &subset_index) in self.total.iter_mut().zip(index_map.iter()) {
                *value += lam_minus[subset_index];
            }
        }

        let share = 1. / num_slots as f64;
        for slot in 0..num_slots {
            let region = &self.regions.regions[region_index];
            let set = region.intersections[slot];
            self.max_marginal.clear();
            self.max_marginal
                .resize(self.regions.sets[set].num_assignments, f64::NEG_INFINITY);
            for (&value, &subset_index) in self.total.iter().zip(region.index_maps[slot].iter()) {
                if value > self.max_marginal[subset_index] {
                    self.max_marginal[subset_index] = value;
                }
            }

            let outgoing = &mut self.regions.regions[region_index].messages[slot];
            for ((message, &max_marginal), &lam_minus) in outgoing
                .iter_mut()
                .zip(self.max_marginal.iter())
                .zip(self.lam_minus[slot].iter())
            {
                *message = if lam_minus == f64::NEG_INFINITY {
                    0.
                } else if max_marginal == f64::NEG_INFINITY {
                    f64::NEG_INFINITY
                } else {
                    max_marginal * share - lam_minus
                };
            }
            for (sum, &max_marginal) in self.regions.sum_into[set]
                .iter_mut()
                .zip(self.max_marginal.iter())
            {
                *sum = max_marginal * share;
            }
        }
    }

    // Energy of the factors containing `variable`
    fn local_energy(&self, variable: usize, assignment: &[usize]) -> InferenceResult<f64> {
        let factors = self.graph.factors();
        let mut energy = 0.;
        for &factor_index in self.variable_factors[variable].iter() {
            energy += factors[factor_index].evaluate_energy(assignment)?;
        }
        Ok(energy)
    }

    // Iterated conditional modes: moves single variables while that strictly lowers the energy
    fn refine(&self, assignment: &mut [usize]) -> InferenceResult<()> {
        let cardinalities = self.graph.cardinalities();
        for _ in 0..MAX_REFINE_PASSES {
            let mut changed = false;
            for variable in 0..assignment.len() {
                let current = assignment[variable];
                let mut best = (current, self.local_energy(variable, assignment)?);
                for state in 0..cardinalities[variable] {
                    if state == current {
                        continue;
                    }
                    assignment[variable] = state;
                    let energy = self.local_energy(variable, assignment)?;
                    if energy < best.1 {
                        best = (state, energy);
                    }
                }
                assignment[variable] = best.0;
                changed |= best.0 != current;
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }
}

impl<'a> MapInference<'a> for Mplp<'a> {
    fn init(graph: &'a FactorGraph) -> InferenceResult<Self> {
        let mut variable_factors = vec![Vec::new(); graph.num_variables()];
        for (factor_index, factor) in graph.factors().iter().enumerate() {
            for &variable in factor.variables().iter() {
                variable_factors[variable].push(factor_index);
            }
        }

        Ok(Mplp {
            graph,
            regions: RegionGraph::new(graph)?,
            variable_factors,
            lam_minus: Vec::new(),
            total: Vec::new(),
            max_marginal: Vec::new(),
        })
    }

    // Runs at least one sweep, since the dual objective is only a bound once every
    // region has been updated
    fn run(mut self, options: &InferenceOptions) -> InferenceResult<MapSolution> {
        let time_start = Instant::now();
        let num_variables = self.graph.num_variables();
        let mut iteration = 0;
        let mut trace: Vec<SweepRecord> = Vec::new();
        let mut best: Option<(Vec<usize>, f64)> = None;
        let status;

        loop {
            for region_index in 0..self.regions.regions.len() {
                self.update_region(region_index);
            }
            iteration += 1;

            let dual_objective = self.regions.dual_objective();
            let mut candidate = self.regions.decode(num_variables);
            self.refine(&mut candidate)?;
            let energy = self.graph.evaluate_energy(&candidate)?;
            if energy.is_finite()
                && best
                    .as_ref()
                    .map_or(true, |(_, best_energy)| energy < *best_energy)
            {
                best = Some((candidate, energy));
            }
            let best_integral_objective = best
                .as_ref()
                .map_or(f64::NEG_INFINITY, |(_, best_energy)| -best_energy);
            trace.push(SweepRecord {
                iteration,
                dual_objective,
                best_integral_objective,
            });

            let elapsed_time = time_start.elapsed();
            debug!(
                "Iteration {}. Elapsed time {:?}. Dual objective {}. Best integral objective {}.",
                iteration, elapsed_time, dual_objective, best_integral_objective
            );

            // Break if a stopping condition is satisfied
            if dual_objective - best_integral_objective < options.int_gap_thr() {
                debug!("Integrality gap below threshold. Interrupting.");
                status = InferenceStatus::GapClosed;
                break;
            }

            let window = options.obj_del_window();
            if iteration > window
                && trace[iteration - 1 - window].dual_objective - dual_objective
                    < options.obj_del_thr()
            {
                debug!("Dual objective decreased less than the threshold. Interrupting.");
                status = InferenceStatus::Stalled;
                break;
            }

            if iteration >= options.max_iterations() {
                info!("Maximum number of iterations reached. Interrupting.");
                status = InferenceStatus::IterationLimit;
                break;
            }

            if elapsed_time >= options.time_max() {
                info!("Time limit reached. Interrupting.");
                status = InferenceStatus::TimeLimit;
                break;
            }
        }

        let (assignment, energy) =
            best.ok_or(InferenceError::NoFiniteEnergy { iterations: iteration })?;
        let dual_objective = trace
            .last()
            .map_or(f64::INFINITY, |record| record.dual_objective);
        info!(
            "MPLP finished after {} iterations. Elapsed time {:?}. Energy {}. Dual bound {}.",
            iteration,
            time_start.elapsed(),
            energy,
            -dual_objective
        );

        Ok(MapSolution {
            assignment,
            energy,
            dual_bound: -dual_objective,
            gap: energy + dual_objective,
            iterations: iteration,
            status,
            trace,
        })
    }
}
