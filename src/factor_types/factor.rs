use std::sync::Arc;

use crate::{
    errors::{FactorGraphError, GraphResult},
    factor_types::{factor_data::FactorData, factor_type::FactorType},
};

// Energy table of a factor: a view of the type's weights, or a buffer owned by the factor
#[derive(Debug, Clone)]
enum Energies {
    Shared(Arc<[f64]>),
    Owned(Vec<f64>),
}

impl Energies {
    fn as_slice(&self) -> &[f64] {
        match self {
            Energies::Shared(table) => table,
            Energies::Owned(table) => table,
        }
    }
}

// A factor type bound to a subset of graph variables and, optionally, to per-example data
#[derive(Debug, Clone)]
pub struct Factor {
    factor_type: Arc<FactorType>,
    variables: Vec<usize>,
    data: FactorData,
    energies: Energies,
}

impl Factor {
    // Creates a factor; energies of data-dependent factors stay zero until compute_energies()
    pub fn new(
        factor_type: Arc<FactorType>,
        variables: Vec<usize>,
        data: FactorData,
    ) -> GraphResult<Self> {
        if variables.len() != factor_type.num_variables() {
            return Err(FactorGraphError::ArityMismatch {
                type_id: factor_type.type_id().to_string(),
                expected: factor_type.num_variables(),
                actual: variables.len(),
            });
        }
        for (position, variable) in variables.iter().enumerate() {
            if variables[..position].contains(variable) {
                return Err(FactorGraphError::DuplicateVariable(*variable));
            }
        }

        let energies = match data {
            FactorData::Independent => Energies::Shared(factor_type.get_w()),
            _ => Energies::Owned(vec![0.; factor_type.num_assignments()]),
        };

        Ok(Factor {
            factor_type,
            variables,
            data,
            energies,
        })
    }

    // Creates a data-independent factor whose energies are the type's weights
    pub fn independent(factor_type: Arc<FactorType>, variables: Vec<usize>) -> GraphResult<Self> {
        Self::new(factor_type, variables, FactorData::Independent)
    }

    pub fn factor_type(&self) -> &Arc<FactorType> {
        &self.factor_type
    }

    pub fn variables(&self) -> &[usize] {
        &self.variables
    }

    pub fn data(&self) -> &FactorData {
        &self.data
    }

    pub fn is_data_dependent(&self) -> bool {
        self.data.is_data_dependent()
    }

    pub fn energies(&self) -> &[f64] {
        self.energies.as_slice()
    }

    // Refreshes the energy table from the factor type's current weights
    pub fn compute_energies(&mut self) -> GraphResult<()> {
        match &mut self.energies {
            Energies::Owned(table) if self.data.is_data_dependent() => {
                self.factor_type.compute_energies(&self.data, table)
            }
            energies => {
                *energies = Energies::Shared(self.factor_type.energy_table()?);
                Ok(())
            }
        }
    }

    // Energy of the factor's variables as they are set in a full graph assignment
    pub fn evaluate_energy(&self, state: &[usize]) -> GraphResult<f64> {
        let ei = self
            .factor_type
            .index_from_universe_assignment(state, &self.variables);
        self.energy_at(ei)
    }

    pub fn energy_at(&self, ei: usize) -> GraphResult<f64> {
        let table = self.energies.as_slice();
        table
            .get(ei)
            .copied()
            .ok_or(FactorGraphError::EnergyIndexOutOfRange {
                index: ei,
                size: table.len(),
            })
    }

    // Overwrites one entry of a data-dependent factor's energy table
    pub fn set_energy(&mut self, ei: usize, value: f64) -> GraphResult<()> {
        match &mut self.energies {
            Energies::Owned(table) if self.data.is_data_dependent() => {
                let size = table.len();
                let energy = table
                    .get_mut(ei)
                    .ok_or(FactorGraphError::EnergyIndexOutOfRange { index: ei, size })?;
                *energy = value;
                Ok(())
            }
            _ => Err(FactorGraphError::SharedEnergies(
                self.factor_type.type_id().to_string(),
            )),
        }
    }

    // Adds `delta` to one energy; a shared table is copied into the factor first and
    // is shared again after the next compute_energies()
    pub(crate) fn shift_energy(&mut self, ei: usize, delta: f64) {
        if let Energies::Shared(table) = &self.energies {
            self.energies = Energies::Owned(table.to_vec());
        }
        if let Energies::Owned(table) = &mut self.energies {
            table[ei] += delta;
        }
    }

    // Number of weights per joint state that this factor contributes gradients to
    fn data_size(&self) -> usize {
        match (&self.data, self.factor_type.data_size()) {
            (FactorData::Independent, _) => 1,
            (_, Some(data_size)) => data_size,
            (data, None) => data.dense_values().map_or(0, |values| values.len()),
        }
    }

    // Accumulates Σ_ei marginals[ei] * ∂E[ei]/∂w into gradients[offset..]
    pub fn compute_gradients(&self, marginals: &[f64], gradients: &mut [f64], offset: usize) {
        assert_eq!(
            marginals.len(),
            self.factor_type.num_assignments(),
            "Marginals don't match the factor's energy table."
        );
        for (ei, &marginal) in marginals.iter().enumerate() {
            if marginal != 0. {
                self.add_state_gradient(ei, marginal, gradients, offset);
            }
        }
    }

    // Accumulates scale * ∂E[ei]/∂w into gradients[offset..] for a single joint state
    pub fn add_state_gradient(&self, ei: usize, scale: f64, gradients: &mut [f64], offset: usize) {
        match self.data {
            FactorData::Independent => gradients[offset + ei] += scale,
            _ => {
                let base = offset + ei * self.data_size();
                self.data
                    .for_each_entry(|k, value| gradients[base + k] += scale * value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::factor_types::factor_data::SparseEntry;

    use super::*;

    fn pairwise_type(w: Vec<f64>) -> Arc<FactorType> {
        Arc::new(FactorType::new("pairwise", vec![2, 2], w).unwrap())
    }

    #[test]
    fn independent_factor_views_type_weights() {
        let ftype = pairwise_type(vec![1., 0.2, -0.2, 1.]);
        let mut factor = Factor::independent(ftype.clone(), vec![0, 1]).unwrap();
        assert_eq!(factor.energies(), &[1., 0.2, -0.2, 1.]);
        assert_eq!(factor.evaluate_energy(&[1, 0]).unwrap(), 0.2);

        ftype.set_w(vec![2., 2., 2., 2.]).unwrap();
        factor.compute_energies().unwrap();
        assert_eq!(factor.evaluate_energy(&[1, 0]).unwrap(), 2.);
        assert!(factor.set_energy(0, 5.).is_err());
    }

    #[test]
    fn dependent_factor_owns_energies() {
        let ftype = pairwise_type(vec![1.; 8]);
        let mut factor = Factor::new(ftype, vec![2, 0], vec![0.5, 0.25].into()).unwrap();
        factor.compute_energies().unwrap();
        assert_eq!(factor.energies(), &[0.75; 4]);

        factor.set_energy(3, -1.).unwrap();
        // variables are [2, 0], so state (x2 = 1, x0 = 1) lands at index 3
        assert_eq!(factor.evaluate_energy(&[1, 0, 1]).unwrap(), -1.);
        assert!(factor.set_energy(4, 0.).is_err());
    }

    #[test]
    fn factor_validates_variables() {
        let ftype = pairwise_type(vec![0.; 4]);
        assert!(Factor::independent(ftype.clone(), vec![0]).is_err());
        assert_eq!(
            Factor::independent(ftype, vec![1, 1]).unwrap_err(),
            FactorGraphError::DuplicateVariable(1)
        );
    }

    #[test]
    fn shifted_shared_energies_are_private() {
        let ftype = pairwise_type(vec![0.; 4]);
        let mut first = Factor::independent(ftype.clone(), vec![0, 1]).unwrap();
        let second = Factor::independent(ftype.clone(), vec![1, 2]).unwrap();
        first.shift_energy(2, -0.5);
        assert_eq!(first.energies(), &[0., 0., -0.5, 0.]);
        assert_eq!(second.energies(), &[0.; 4]);
        assert_eq!(ftype.get_w().as_ref(), &[0.; 4]);

        first.compute_energies().unwrap();
        assert_eq!(first.energies(), &[0.; 4]);
    }

    #[test]
    fn gradients_of_dense_and_sparse_data() {
        let marginals = [0.25, 0.4, 0.1, 0.25];
        let expected = [0.025, 0.05, 0.04, 0.08, 0.01, 0.02, 0.025, 0.05];

        let ftype = pairwise_type(vec![0.; 8]);
        let dense = Factor::new(ftype.clone(), vec![0, 1], vec![0.1, 0.2].into()).unwrap();
        let sparse = Factor::new(
            ftype,
            vec![0, 1],
            vec![
                SparseEntry { index: 0, value: 0.1 },
                SparseEntry { index: 1, value: 0.2 },
            ]
            .into(),
        )
        .unwrap();

        for factor in [dense, sparse] {
            let mut gradients = vec![0.; 8];
            factor.compute_gradients(&marginals, &mut gradients, 0);
            for (g, e) in gradients.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(g, e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn gradients_accumulate_over_factors() {
        let marginals = [0.25, 0.4, 0.1, 0.25];
        let expected = [0.225, 0.3, 0.36, 0.48, 0.09, 0.12, 0.225, 0.3];
        let ftype = pairwise_type(vec![0.; 8]);

        let mut gradients = vec![0.; 8];
        for (data, variables) in [
            (vec![0.1, 0.2], vec![0, 1]),
            (vec![0.3, 0.4], vec![1, 2]),
            (vec![0.5, 0.6], vec![2, 3]),
        ] {
            let factor = Factor::new(ftype.clone(), variables, data.into()).unwrap();
            factor.compute_gradients(&marginals, &mut gradients, 0);
        }
        for (g, e) in gradients.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-12);
        }
    }
}
