use petgraph::unionfind::UnionFind;

use crate::factor_types::factor::Factor;

// Connectivity of the variables of a factor graph
//
// Built by unioning every variable of a factor with the factor's first variable.
// A union of two variables that are already connected marks a cycle. A union collides
// exactly when the factor's variables were not in pairwise distinct components before, so
// `has_cycle` is exact for the bipartite factor-variable graph. Two factors sharing two
// or more variables count as a cycle.
#[derive(Debug, Clone)]
pub struct GraphStructure {
    disjoint_set: UnionFind<usize>,
    num_components: usize,
    has_cycle: bool,
}

impl GraphStructure {
    pub fn analyze(num_variables: usize, factors: &[Factor]) -> Self {
        let mut disjoint_set = UnionFind::new(num_variables);
        let mut has_cycle = false;

        for factor in factors.iter() {
            let variables = factor.variables();
            for &variable in variables.iter().skip(1) {
                if !disjoint_set.union(variables[0], variable) {
                    has_cycle = true;
                }
            }
        }

        let mut labels = disjoint_set.clone().into_labeling();
        labels.sort_unstable();
        labels.dedup();

        GraphStructure {
            disjoint_set,
            num_components: labels.len(),
            has_cycle,
        }
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    pub fn has_cycle(&self) -> bool {
        self.has_cycle
    }

    // Representative of the connected component containing `variable`
    pub fn component_of(&self, variable: usize) -> usize {
        self.disjoint_set.find(variable)
    }
}
