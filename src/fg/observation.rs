use crate::errors::{FactorGraphError, GraphResult};

// A joint assignment of a factor graph together with per-variable loss weights
#[derive(Debug, Clone, PartialEq)]
pub struct FactorGraphObservation {
    states: Vec<usize>,
    loss_weights: Vec<f64>,
}

impl FactorGraphObservation {
    // Creates an observation with uniform loss weights 1 / num_variables
    pub fn new(states: Vec<usize>) -> Self {
        let weight = if states.is_empty() {
            0.
        } else {
            1. / states.len() as f64
        };
        let loss_weights = vec![weight; states.len()];
        FactorGraphObservation {
            states,
            loss_weights,
        }
    }

    pub fn with_loss_weights(states: Vec<usize>, loss_weights: Vec<f64>) -> GraphResult<Self> {
        if loss_weights.len() != states.len() {
            return Err(FactorGraphError::LossWeightsLength {
                expected: states.len(),
                actual: loss_weights.len(),
            });
        }
        Ok(FactorGraphObservation {
            states,
            loss_weights,
        })
    }

    pub fn states(&self) -> &[usize] {
        &self.states
    }

    pub fn loss_weights(&self) -> &[f64] {
        &self.loss_weights
    }

    pub fn num_variables(&self) -> usize {
        self.states.len()
    }

    // Checks the observation against the variable cardinalities of a graph
    pub fn validate(&self, cardinalities: &[usize]) -> GraphResult<()> {
        if self.states.len() != cardinalities.len() {
            return Err(FactorGraphError::AssignmentLength {
                expected: cardinalities.len(),
                actual: self.states.len(),
            });
        }
        for (variable, (&state, &cardinality)) in
            self.states.iter().zip(cardinalities.iter()).enumerate()
        {
            if state >= cardinality {
                return Err(FactorGraphError::StateOutOfRange {
                    variable,
                    state,
                    cardinality,
                });
            }
        }
        Ok(())
    }

    // Weighted Hamming distance to another assignment, using this observation's weights
    pub fn hamming_loss(&self, other: &[usize]) -> GraphResult<f64> {
        if other.len() != self.states.len() {
            return Err(FactorGraphError::AssignmentLength {
                expected: self.states.len(),
                actual: other.len(),
            });
        }
        Ok(self
            .states
            .iter()
            .zip(other.iter())
            .zip(self.loss_weights.iter())
            .filter(|((truth, predicted), _)| truth != predicted)
            .map(|(_, weight)| weight)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn default_weights_are_uniform() {
        let observation = FactorGraphObservation::new(vec![0, 1, 1, 0]);
        assert_eq!(observation.loss_weights(), &[0.25; 4]);
        assert_abs_diff_eq!(observation.hamming_loss(&[1, 1, 0, 0]).unwrap(), 0.5);
        assert_abs_diff_eq!(observation.hamming_loss(&[0, 1, 1, 0]).unwrap(), 0.);
    }

    #[test]
    fn validation() {
        let observation = FactorGraphObservation::new(vec![0, 2]);
        assert!(observation.validate(&[2, 3]).is_ok());
        assert!(observation.validate(&[2, 2]).is_err());
        assert!(observation.validate(&[2, 3, 2]).is_err());
        assert!(FactorGraphObservation::with_loss_weights(vec![0, 1], vec![1.]).is_err());
    }
}
