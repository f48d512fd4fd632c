use std::sync::Arc;

// One non-zero entry of a sparse data vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseEntry {
    pub index: usize,
    pub value: f64,
}

// Per-example data attached to a factor
#[derive(Debug, Clone, PartialEq)]
pub enum FactorData {
    Independent,           // energies are the factor type's weights
    Dense(Vec<f64>),       // data owned by this factor
    Sparse(Vec<SparseEntry>),
    Shared(Arc<[f64]>),    // dense data shared between factors of many graphs
}

impl FactorData {
    pub fn is_data_dependent(&self) -> bool {
        !matches!(self, FactorData::Independent)
    }

    pub fn dense_values(&self) -> Option<&[f64]> {
        match self {
            FactorData::Dense(values) => Some(values),
            FactorData::Shared(values) => Some(values),
            _ => None,
        }
    }

    // Calls `f(k, value)` for every stored data entry
    pub fn for_each_entry<F: FnMut(usize, f64)>(&self, mut f: F) {
        match self {
            FactorData::Independent => {}
            FactorData::Dense(_) | FactorData::Shared(_) => {
                if let Some(values) = self.dense_values() {
                    for (k, &value) in values.iter().enumerate() {
                        f(k, value);
                    }
                }
            }
            FactorData::Sparse(entries) => {
                for entry in entries.iter() {
                    f(entry.index, entry.value);
                }
            }
        }
    }
}

impl From<Vec<f64>> for FactorData {
    fn from(values: Vec<f64>) -> Self {
        FactorData::Dense(values)
    }
}

impl From<Vec<SparseEntry>> for FactorData {
    fn from(entries: Vec<SparseEntry>) -> Self {
        FactorData::Sparse(entries)
    }
}
