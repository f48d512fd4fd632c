use std::time::Instant;

use log::{debug, info};
use petgraph::{
    graph::{NodeIndex, UnGraph},
    visit::{depth_first_search, Control, DfsEvent},
};

use crate::{
    errors::{InferenceError, InferenceResult},
    fg::factor_graph::FactorGraph,
    inference::map_inference::{InferenceOptions, InferenceStatus, MapInference, MapSolution},
};

// Node of the bipartite variable-factor graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Variable(usize),
    Factor(usize),
}

// Exact min-sum (max-product on potentials) for factor graphs without cycles.
// Every connected component is rooted at its smallest variable; messages flow from the
// leaves to the roots and the assignment is read back along the stored argmins.
pub struct TreeMaxProduct<'a> {
    graph: &'a FactorGraph,
    order: Vec<Node>,           // nodes in DFS discovery order, roots first
    parent: Vec<Option<Node>>,  // parent of each variable node, indexed by variable
    factor_parent: Vec<usize>,  // position of the parent variable within each factor
}

impl<'a> TreeMaxProduct<'a> {
    fn build_schedule(graph: &FactorGraph) -> (Vec<Node>, Vec<Option<Node>>, Vec<usize>) {
        let num_variables = graph.num_variables();
        let mut bipartite = UnGraph::<Node, ()>::with_capacity(
            num_variables + graph.num_factors(),
            graph.num_edges(),
        );
        for variable in 0..num_variables {
            bipartite.add_node(Node::Variable(variable));
        }
        for (factor_index, factor) in graph.factors().iter().enumerate() {
            let factor_node = bipartite.add_node(Node::Factor(factor_index));
            for &variable in factor.variables().iter() {
                bipartite.add_edge(NodeIndex::new(variable), factor_node, ());
            }
        }

        // Roots are visited in increasing variable order, so each component is rooted
        // at its smallest variable
        let mut order = Vec::with_capacity(bipartite.node_count());
        let mut parent = vec![None; num_variables];
        let mut factor_parent = vec![0; graph.num_factors()];
        let roots = (0..num_variables).map(NodeIndex::new);
        depth_first_search(&bipartite, roots, |event| {
            match event {
                DfsEvent::Discover(node, _) => order.push(bipartite[node]),
                DfsEvent::TreeEdge(source, target) => match (bipartite[source], bipartite[target]) {
                    (Node::Factor(factor_index), Node::Variable(variable)) => {
                        parent[variable] = Some(Node::Factor(factor_index));
                    }
                    (Node::Variable(variable), Node::Factor(factor_index)) => {
                        factor_parent[factor_index] = graph.factors()[factor_index]
                            .variables()
                            .iter()
                            .position(|&v| v == variable)
                            .unwrap_or(0);
                    }
                    _ => {}
                },
                _ => {}
            }
            Control::<()>::Continue
        });

        (order, parent, factor_parent)
    }
}

impl<'a> MapInference<'a> for TreeMaxProduct<'a> {
    fn init(graph: &'a FactorGraph) -> InferenceResult<Self> {
        if !graph.is_acyclic_graph()? {
            return Err(InferenceError::NotATree);
        }
        let (order, parent, factor_parent) = Self::build_schedule(graph);
        Ok(TreeMaxProduct {
            graph,
            order,
            parent,
            factor_parent,
        })
    }

    fn run(self, _options: &InferenceOptions) -> InferenceResult<MapSolution> {
        let time_start = Instant::now();
        let graph = self.graph;
        let factors = graph.factors();

        // incoming[v][x] = sum of messages from the child factors of variable v
        let mut incoming = graph
            .cardinalities()
            .iter()
            .map(|&card| vec![0.; card])
            .collect::<Vec<_>>();
        // argmin[f][x] = joint state of factor f minimizing its subtree given its parent at x
        let mut argmin = vec![Vec::new(); factors.len()];

        // Upward pass: leaves first
        for node in self.order.iter().rev() {
            let factor_index = match node {
                Node::Factor(factor_index) => *factor_index,
                Node::Variable(_) => continue,
            };
            let factor = &factors[factor_index];
            let factor_type = factor.factor_type();
            let variables = factor.variables();
            let parent_position = self.factor_parent[factor_index];
            let parent_variable = variables[parent_position];

            let mut message = vec![f64::INFINITY; graph.cardinalities()[parent_variable]];
            let mut best = vec![0; message.len()];
            for (ei, &energy) in factor.energies().iter().enumerate() {
                let mut value = energy;
                for (position, &variable) in variables.iter().enumerate() {
                    if position != parent_position {
                        value += incoming[variable][factor_type.variable_state_from_index(ei, position)];
                    }
                }
                let parent_state = factor_type.variable_state_from_index(ei, parent_position);
                if value < message[parent_state] {
                    message[parent_state] = value;
                    best[parent_state] = ei;
                }
            }

            for (total, value) in incoming[parent_variable].iter_mut().zip(message.iter()) {
                *total += value;
            }
            argmin[factor_index] = best;
        }

        // Downward pass: roots first
        let mut assignment = vec![0; graph.num_variables()];
        let mut min_energy = 0.;
        for node in self.order.iter() {
            match node {
                Node::Variable(variable) if self.parent[*variable].is_none() => {
                    let (state, value) = incoming[*variable]
                        .iter()
                        .enumerate()
                        .fold((0, f64::INFINITY), |(best_state, best_value), (state, &value)| {
                            if value < best_value {
                                (state, value)
                            } else {
                                (best_state, best_value)
                            }
                        });
                    assignment[*variable] = state;
                    min_energy += value;
                }
                Node::Variable(_) => {}
                Node::Factor(factor_index) => {
                    let factor = &factors[*factor_index];
                    let parent_position = self.factor_parent[*factor_index];
                    let parent_state = assignment[factor.variables()[parent_position]];
                    let ei = argmin[*factor_index][parent_state];
                    for (position, &variable) in factor.variables().iter().enumerate() {
                        if position != parent_position {
                            assignment[variable] =
                                factor.factor_type().variable_state_from_index(ei, position);
                        }
                    }
                }
            }
        }

        let energy = graph.evaluate_energy(&assignment)?;
        if !energy.is_finite() {
            return Err(InferenceError::NoFiniteEnergy { iterations: 1 });
        }
        debug!(
            "Tree max-product message minimum {}, decoded energy {}",
            min_energy, energy
        );
        info!(
            "Tree max-product finished. Elapsed time {:?}. Energy {}.",
            time_start.elapsed(),
            energy
        );

        Ok(MapSolution {
            assignment,
            energy,
            dual_bound: energy,
            gap: 0.,
            iterations: 1,
            status: InferenceStatus::Exact,
            trace: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::factor_types::{factor::Factor, factor_type::FactorType};

    use super::*;

    fn random_type(rng: &mut StdRng, id: &str, cardinalities: Vec<usize>) -> Arc<FactorType> {
        let size = cardinalities.iter().product::<usize>();
        let w = (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Arc::new(FactorType::new(id, cardinalities, w).unwrap())
    }

    fn solve(graph: &FactorGraph) -> MapSolution {
        TreeMaxProduct::init(graph)
            .unwrap()
            .run(&InferenceOptions::default())
            .unwrap()
    }

    #[test]
    fn four_variable_chain_is_exact() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut graph = FactorGraph::new(vec![2; 4]);
            for variable in 0..4 {
                let unary = random_type(&mut rng, "unary", vec![2]);
                graph.add_factor(Factor::independent(unary, vec![variable]).unwrap()).unwrap();
            }
            for variable in 0..3 {
                let pairwise = random_type(&mut rng, "pairwise", vec![2, 2]);
                graph
                    .add_factor(Factor::independent(pairwise, vec![variable, variable + 1]).unwrap())
                    .unwrap();
            }
            graph.connect_components();

            let (_, best_energy) = graph.brute_force_map().unwrap();
            let solution = solve(&graph);
            assert_abs_diff_eq!(solution.energy, best_energy, epsilon = 1e-9);
            assert_eq!(solution.status, InferenceStatus::Exact);
        }
    }

    #[test]
    fn higher_order_tree_and_forest() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            // {0,1,2} - {2,3} is one tree, {4,5} is a second component, 6 is isolated
            let mut graph = FactorGraph::new(vec![2, 3, 2, 3, 2, 2, 2]);
            let triple = random_type(&mut rng, "triple", vec![2, 3, 2]);
            let pair = random_type(&mut rng, "pair", vec![2, 3]);
            let other = random_type(&mut rng, "other", vec![2, 2]);
            graph.add_factor(Factor::independent(triple, vec![0, 1, 2]).unwrap()).unwrap();
            graph.add_factor(Factor::independent(pair, vec![2, 3]).unwrap()).unwrap();
            graph.add_factor(Factor::independent(other, vec![5, 4]).unwrap()).unwrap();
            graph.connect_components();
            assert!(!graph.is_tree_graph().unwrap());

            let (_, best_energy) = graph.brute_force_map().unwrap();
            let solution = solve(&graph);
            assert_abs_diff_eq!(solution.energy, best_energy, epsilon = 1e-9);
            assert_eq!(solution.assignment[6], 0);
        }
    }

    #[test]
    fn ties_pick_first_state() {
        let flat = Arc::new(FactorType::new("flat", vec![2, 2], vec![1.; 4]).unwrap());
        let mut graph = FactorGraph::new(vec![2, 2]);
        graph.add_factor(Factor::independent(flat, vec![0, 1]).unwrap()).unwrap();
        graph.connect_components();
        assert_eq!(solve(&graph).assignment, vec![0, 0]);
    }

    #[test]
    fn infinite_energies_are_reported() {
        let blocked = Arc::new(FactorType::new("blocked", vec![2], vec![f64::INFINITY; 2]).unwrap());
        let mut graph = FactorGraph::new(vec![2]);
        graph.add_factor(Factor::independent(blocked, vec![0]).unwrap()).unwrap();
        graph.connect_components();
        let result = TreeMaxProduct::init(&graph)
            .unwrap()
            .run(&InferenceOptions::default());
        assert!(matches!(result, Err(InferenceError::NoFiniteEnergy { .. })));
    }
}
