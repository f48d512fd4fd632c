use std::sync::{Arc, PoisonError, RwLock};

use crate::{
    errors::{FactorGraphError, GraphResult},
    factor_types::factor_data::FactorData,
};

// Weight vector of a factor type together with the data size it was fixed to
#[derive(Debug)]
struct TypeParams {
    w: Arc<[f64]>,
    data_size: Option<usize>, // number of weights per joint state, fixed by the first non-empty `w`
}

// Describes a class of factors: the cardinalities of its variable slots and a weight vector
// that is shared by every factor of this type.
// Joint states are flattened with the first variable changing fastest, i.e.
// index = Σ state[i] * cumprod_cardinalities[i].
#[derive(Debug)]
pub struct FactorType {
    type_id: String,
    cardinalities: Vec<usize>,
    cumprod_cardinalities: Vec<usize>,
    num_assignments: usize,
    params: RwLock<TypeParams>,
}

impl FactorType {
    // Creates a factor type with the given weights; an empty `w` leaves the data size open
    pub fn new(type_id: &str, cardinalities: Vec<usize>, w: Vec<f64>) -> GraphResult<Self> {
        let factor_type = Self::with_cardinalities(type_id, cardinalities)?;
        if !w.is_empty() {
            factor_type.set_w(w)?;
        }
        Ok(factor_type)
    }

    // Creates a factor type with zero weights and a fixed number of weights per joint state
    pub fn with_data_size(
        type_id: &str,
        cardinalities: Vec<usize>,
        data_size: usize,
    ) -> GraphResult<Self> {
        let factor_type = Self::with_cardinalities(type_id, cardinalities)?;
        if data_size == 0 {
            return Err(FactorGraphError::DataSize {
                type_id: type_id.to_string(),
                message: "data size must be positive".to_string(),
            });
        }
        {
            let mut params = factor_type.params.write().unwrap_or_else(PoisonError::into_inner);
            params.w = vec![0.; factor_type.num_assignments * data_size].into();
            params.data_size = Some(data_size);
        }
        Ok(factor_type)
    }

    fn with_cardinalities(type_id: &str, cardinalities: Vec<usize>) -> GraphResult<Self> {
        if cardinalities.is_empty() || cardinalities.iter().any(|&card| card == 0) {
            return Err(FactorGraphError::DataSize {
                type_id: type_id.to_string(),
                message: format!("invalid cardinalities {:?}", cardinalities),
            });
        }

        let mut cumprod_cardinalities = Vec::with_capacity(cardinalities.len());
        let mut product = 1;
        for card in cardinalities.iter() {
            cumprod_cardinalities.push(product);
            product *= card;
        }

        Ok(FactorType {
            type_id: type_id.to_string(),
            cardinalities,
            cumprod_cardinalities,
            num_assignments: product,
            params: RwLock::new(TypeParams {
                w: Vec::new().into(),
                data_size: None,
            }),
        })
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn get_cardinalities(&self) -> &[usize] {
        &self.cardinalities
    }

    pub fn cumprod_cardinalities(&self) -> &[usize] {
        &self.cumprod_cardinalities
    }

    pub fn num_variables(&self) -> usize {
        self.cardinalities.len()
    }

    // Number of joint states, i.e. the size of an energy table of this type
    pub fn num_assignments(&self) -> usize {
        self.num_assignments
    }

    // Number of weights per joint state, if already fixed
    pub fn data_size(&self) -> Option<usize> {
        self.params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .data_size
    }

    pub fn num_params(&self) -> usize {
        self.params.read().unwrap_or_else(PoisonError::into_inner).w.len()
    }

    // Returns the current weights; empty if they were never set
    pub fn get_w(&self) -> Arc<[f64]> {
        self.params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .w
            .clone()
    }

    // Replaces the weights, keeping the data size fixed once it is known
    pub fn set_w(&self, w: Vec<f64>) -> GraphResult<()> {
        if w.is_empty() || w.len() % self.num_assignments != 0 {
            return Err(FactorGraphError::DataSize {
                type_id: self.type_id.clone(),
                message: format!(
                    "weight length {} is not a positive multiple of {} joint states",
                    w.len(),
                    self.num_assignments
                ),
            });
        }

        let data_size = w.len() / self.num_assignments;
        let mut params = self.params.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(fixed) = params.data_size {
            if fixed != data_size {
                return Err(FactorGraphError::DataSize {
                    type_id: self.type_id.clone(),
                    message: format!(
                        "weight length {} does not match the fixed data size {}",
                        w.len(),
                        fixed
                    ),
                });
            }
        }
        params.w = w.into();
        params.data_size = Some(data_size);
        Ok(())
    }

    // Returns the weights as an energy table for data-independent factors
    pub fn energy_table(&self) -> GraphResult<Arc<[f64]>> {
        let w = self.get_w();
        if w.len() != self.num_assignments {
            return Err(FactorGraphError::DataSize {
                type_id: self.type_id.clone(),
                message: format!(
                    "a data-independent factor needs {} weights, found {}",
                    self.num_assignments,
                    w.len()
                ),
            });
        }
        Ok(w)
    }

    // Computes one energy per joint state as a linear function of the weights and the data.
    // Without weights, dense data is taken as the energy table itself.
    pub fn compute_energies(&self, data: &FactorData, energies: &mut Vec<f64>) -> GraphResult<()> {
        let w = self.get_w();
        energies.clear();
        energies.resize(self.num_assignments, 0.);

        match data {
            FactorData::Independent => {
                let table = self.energy_table()?;
                energies.copy_from_slice(&table);
            }
            FactorData::Dense(_) | FactorData::Shared(_) => {
                let values = data.dense_values().unwrap_or_default();
                if w.is_empty() {
                    self.check_data_len(values.len(), self.num_assignments)?;
                    energies.copy_from_slice(values);
                    return Ok(());
                }
                let dim = w.len() / self.num_assignments;
                self.check_data_len(values.len(), dim)?;
                for (ei, energy) in energies.iter_mut().enumerate() {
                    *energy = w[ei * dim..(ei + 1) * dim]
                        .iter()
                        .zip(values.iter())
                        .map(|(wk, xk)| wk * xk)
                        .sum();
                }
            }
            FactorData::Sparse(entries) => {
                if w.is_empty() {
                    return Err(FactorGraphError::DataSize {
                        type_id: self.type_id.clone(),
                        message: "sparse data requires weights".to_string(),
                    });
                }
                let dim = w.len() / self.num_assignments;
                if let Some(entry) = entries.iter().find(|entry| entry.index >= dim) {
                    return Err(FactorGraphError::DataSize {
                        type_id: self.type_id.clone(),
                        message: format!("sparse index {} exceeds data size {}", entry.index, dim),
                    });
                }
                for (ei, energy) in energies.iter_mut().enumerate() {
                    *energy = entries
                        .iter()
                        .map(|entry| w[ei * dim + entry.index] * entry.value)
                        .sum();
                }
            }
        }
        Ok(())
    }

    fn check_data_len(&self, actual: usize, expected: usize) -> GraphResult<()> {
        if actual != expected {
            return Err(FactorGraphError::DataSize {
                type_id: self.type_id.clone(),
                message: format!("expected {} data values, got {}", expected, actual),
            });
        }
        Ok(())
    }

    // Maps a joint state of the factor's variables to its flat index
    pub fn index_from_assignment(&self, assignment: &[usize]) -> usize {
        assert_eq!(
            assignment.len(),
            self.cardinalities.len(),
            "Assignment length doesn't match the number of variables of the factor type."
        );
        assignment
            .iter()
            .zip(self.cardinalities.iter())
            .zip(self.cumprod_cardinalities.iter())
            .map(|((&state, &card), &stride)| {
                assert!(state < card, "State {} is out of range {}.", state, card);
                state * stride
            })
            .sum()
    }

    // Inverse of index_from_assignment()
    pub fn state_from_index(&self, ei: usize) -> Vec<usize> {
        assert!(ei < self.num_assignments, "Energy index {} is out of range.", ei);
        self.cardinalities
            .iter()
            .zip(self.cumprod_cardinalities.iter())
            .map(|(&card, &stride)| (ei / stride) % card)
            .collect()
    }

    // State of the variable in slot `position` within the joint state `ei`
    pub fn variable_state_from_index(&self, ei: usize, position: usize) -> usize {
        (ei / self.cumprod_cardinalities[position]) % self.cardinalities[position]
    }

    // Flat index of the factor's variables read out of a full graph assignment
    pub fn index_from_universe_assignment(&self, universe: &[usize], variables: &[usize]) -> usize {
        assert_eq!(
            variables.len(),
            self.cardinalities.len(),
            "Number of variables doesn't match the factor type."
        );
        variables
            .iter()
            .zip(self.cumprod_cardinalities.iter())
            .map(|(&variable, &stride)| universe[variable] * stride)
            .sum()
    }

    // Flat index obtained from `ei` by changing the state of slot `position` to `state`
    pub fn index_from_new_state(&self, ei: usize, position: usize, state: usize) -> usize {
        let stride = self.cumprod_cardinalities[position];
        let old_state = (ei / stride) % self.cardinalities[position];
        ei - old_state * stride + state * stride
    }
}
