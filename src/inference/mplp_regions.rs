use std::collections::HashMap;

use crate::{
    errors::{InferenceError, InferenceResult},
    fg::factor_graph::FactorGraph,
};

// A set of variables shared by regions; dual variables live on its joint states
#[derive(Debug, Clone)]
pub struct IntersectionSet {
    pub variables: Vec<usize>,         // sorted
    pub num_assignments: usize,
    pub regions: Vec<(usize, usize)>,  // (region, slot of this set within the region)
}

// One factor of the graph seen as an MPLP region
#[derive(Debug, Clone)]
pub struct Region {
    pub potentials: Vec<f64>,          // negated energies of the factor
    pub intersections: Vec<usize>,     // indices into RegionGraph::sets
    pub index_maps: Vec<Vec<usize>>,   // joint state of the region -> joint state of each set
    pub messages: Vec<Vec<f64>>,       // dual variables from this region to each set
}

// Regions and intersection sets of a factor graph, built once per inference call
#[derive(Debug, Clone)]
pub struct RegionGraph {
    pub regions: Vec<Region>,
    pub sets: Vec<IntersectionSet>,
    pub sum_into: Vec<Vec<f64>>,           // sum of all messages into each set
    pub singletons: Vec<Option<usize>>,    // set holding each single variable, if covered
}

impl RegionGraph {
    // Builds regions from factors. Every region is attached to the singletons of its
    // variables and to every intersection of two or more variables it shares with another
    // region.
    pub fn new(graph: &FactorGraph) -> InferenceResult<Self> {
        let factors = graph.factors();
        let mut set_index = HashMap::<Vec<usize>, usize>::new();
        let mut scopes = Vec::with_capacity(factors.len());
        let mut region_sets = vec![Vec::new(); factors.len()];

        for (factor_index, factor) in factors.iter().enumerate() {
            if let Some(energy) = factor
                .energies()
                .iter()
                .find(|energy| energy.is_nan() || **energy == f64::NEG_INFINITY)
            {
                return Err(InferenceError::InvalidEnergy {
                    factor: factor_index,
                    value: *energy,
                });
            }
            let mut scope = factor.variables().to_vec();
            scope.sort_unstable();
            scopes.push(scope);
        }

        let mut attach = |region: usize, variables: Vec<usize>, region_sets: &mut Vec<Vec<usize>>| {
            let next = set_index.len();
            let set = *set_index.entry(variables).or_insert(next);
            if !region_sets[region].contains(&set) {
                region_sets[region].push(set);
            }
        };

        for (region, scope) in scopes.iter().enumerate() {
            for &variable in scope.iter() {
                attach(region, vec![variable], &mut region_sets);
            }
        }
        for first in 0..scopes.len() {
            for second in first + 1..scopes.len() {
                let shared = scopes[first]
                    .iter()
                    .filter(|variable| scopes[second].binary_search(variable).is_ok())
                    .copied()
                    .collect::<Vec<_>>();
                if shared.len() >= 2 {
                    attach(first, shared.clone(), &mut region_sets);
                    attach(second, shared, &mut region_sets);
                }
            }
        }

        let mut sets = vec![
            IntersectionSet {
                variables: Vec::new(),
                num_assignments: 1,
                regions: Vec::new(),
            };
            set_index.len()
        ];
        for (variables, index) in set_index.into_iter() {
            sets[index].num_assignments = variables
                .iter()
                .map(|&variable| graph.cardinalities()[variable])
                .product();
            sets[index].variables = variables;
        }

        let mut regions = Vec::with_capacity(factors.len());
        for (region_index, factor) in factors.iter().enumerate() {
            let intersections = region_sets[region_index].clone();
            let mut index_maps = Vec::with_capacity(intersections.len());
            let mut messages = Vec::with_capacity(intersections.len());
            for (slot, &set) in intersections.iter().enumerate() {
                sets[set].regions.push((region_index, slot));
                index_maps.push(Self::subset_indexing(
                    graph,
                    factor.variables(),
                    &sets[set].variables,
                    factor.energies().len(),
                ));
                messages.push(vec![0.; sets[set].num_assignments]);
            }
            regions.push(Region {
                potentials: factor.energies().iter().map(|energy| -energy).collect(),
                intersections,
                index_maps,
                messages,
            });
        }

        let mut singletons = vec![None; graph.num_variables()];
        for (index, set) in sets.iter().enumerate() {
            if let [variable] = set.variables[..] {
                singletons[variable] = Some(index);
            }
        }
        let sum_into = sets
            .iter()
            .map(|set| vec![0.; set.num_assignments])
            .collect();

        Ok(RegionGraph {
            regions,
            sets,
            sum_into,
            singletons,
        })
    }

    // For every joint state of a region, the joint state of `subset` it projects to.
    // Subset states are flattened with the first (smallest) variable changing fastest.
    fn subset_indexing(
        graph: &FactorGraph,
        region_variables: &[usize],
        subset: &[usize],
        region_size: usize,
    ) -> Vec<usize> {
        let cardinalities = graph.cardinalities();
        let mut stride = 1;
        let mut region_strides = vec![0; region_variables.len()];
        for &variable in subset.iter() {
            if let Some(position) = region_variables.iter().position(|&v| v == variable) {
                region_strides[position] = stride;
            }
            stride *= cardinalities[variable];
        }

        // walk the region's joint states, first variable fastest
        let mut state = vec![0; region_variables.len()];
        let mut index = 0;
        let mut indexing = Vec::with_capacity(region_size);
        for _ in 0..region_size {
            indexing.push(index);
            for (position, &variable) in region_variables.iter().enumerate() {
                state[position] += 1;
                index += region_strides[position];
                if state[position] < cardinalities[variable] {
                    break;
                }
                index -= state[position] * region_strides[position];
                state[position] = 0;
            }
        }
        indexing
    }

    // Sum of the messages into set `set` from all regions except `region`
    pub fn messages_from_others(&self, set: usize, region: usize, out: &mut Vec<f64>) {
        out.clear();
        out.resize(self.sets[set].num_assignments, 0.);
        for &(other, slot) in self.sets[set].regions.iter() {
            if other != region {
                for (total, message) in out.iter_mut().zip(self.regions[other].messages[slot].iter()) {
                    *total += message;
                }
            }
        }
    }

    // Dual objective: Σ over sets of the maximum of the messages summed into it
    pub fn dual_objective(&self) -> f64 {
        self.sum_into
            .iter()
            .map(|values| values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .sum()
    }

    // Assignment maximizing every variable's singleton belief; ties go to the first state
    pub fn decode(&self, num_variables: usize) -> Vec<usize> {
        (0..num_variables)
            .map(|variable| match self.singletons[variable] {
                Some(set) => {
                    self.sum_into[set]
                        .iter()
                        .enumerate()
                        .fold((0, f64::NEG_INFINITY), |(best_state, best_value), (state, &value)| {
                            if value > best_value {
                                (state, value)
                            } else {
                                (best_state, best_value)
                            }
                        })
                        .0
                }
                None => 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::factor_types::{factor::Factor, factor_type::FactorType};

    use super::*;

    #[test]
    fn subset_indexing_projects_states() {
        let graph = FactorGraph::new(vec![3, 4, 5]);
        // region over [2, 0], subset [0]
        let indexing = RegionGraph::subset_indexing(&graph, &[2, 0], &[0], 15);
        assert_eq!(indexing[0], 0);
        assert_eq!(indexing[5], 1); // state (x2 = 0, x0 = 1)
        assert_eq!(indexing[14], 2);
        assert_eq!(indexing[4], 0); // state (x2 = 4, x0 = 0)

        // region over [1, 0, 2], subset [0, 2]
        let indexing = RegionGraph::subset_indexing(&graph, &[1, 0, 2], &[0, 2], 60);
        for ei in 0..60 {
            let (x0, x2) = ((ei / 4) % 3, ei / 12);
            assert_eq!(indexing[ei], x0 + 3 * x2);
        }
    }

    #[test]
    fn intersection_sets_of_a_triangle_with_a_triple() {
        let pairwise = Arc::new(FactorType::new("pairwise", vec![2, 2], vec![0.; 4]).unwrap());
        let triple = Arc::new(FactorType::new("triple", vec![2, 2, 2], vec![0.; 8]).unwrap());
        let mut graph = FactorGraph::new(vec![2; 4]);
        graph.add_factor(Factor::independent(triple, vec![0, 1, 2]).unwrap()).unwrap();
        graph.add_factor(Factor::independent(pairwise.clone(), vec![1, 0]).unwrap()).unwrap();
        graph.add_factor(Factor::independent(pairwise, vec![2, 3]).unwrap()).unwrap();

        let regions = RegionGraph::new(&graph).unwrap();
        // four singletons plus the shared pair {0, 1}
        assert_eq!(regions.sets.len(), 5);
        assert_eq!(regions.regions[0].intersections.len(), 4);
        assert_eq!(regions.regions[1].intersections.len(), 3);
        assert_eq!(regions.regions[2].intersections.len(), 2);
        assert!(regions.singletons.iter().all(|set| set.is_some()));
    }
}
