use thiserror::Error;

// Structural errors raised while building or querying a factor graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactorGraphError {
    #[error("variable index {index} is out of range for a graph with {num_variables} variables")]
    VariableOutOfRange { index: usize, num_variables: usize },

    #[error("variable {variable} has cardinality {graph} in the graph but {factor} in the factor type")]
    CardinalityMismatch {
        variable: usize,
        graph: usize,
        factor: usize,
    },

    #[error("expected an assignment of length {expected}, got {actual}")]
    AssignmentLength { expected: usize, actual: usize },

    #[error("state {state} of variable {variable} is out of range (cardinality {cardinality})")]
    StateOutOfRange {
        variable: usize,
        state: usize,
        cardinality: usize,
    },

    #[error("factor type `{type_id}` expects {expected} variables, got {actual}")]
    ArityMismatch {
        type_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("variable {0} appears more than once in the same factor")]
    DuplicateVariable(usize),

    #[error("factor type `{type_id}`: {message}")]
    DataSize { type_id: String, message: String },

    #[error("cannot set energies on a data-independent factor of type `{0}`")]
    SharedEnergies(String),

    #[error("energy index {index} is out of range for a table of size {size}")]
    EnergyIndexOutOfRange { index: usize, size: usize },

    #[error("graph structure is stale; call connect_components() after adding factors")]
    StaleStructure,

    #[error("variable {0} is not covered by any factor")]
    UnaugmentedVariable(usize),

    #[error("expected {expected} loss weights, got {actual}")]
    LossWeightsLength { expected: usize, actual: usize },

    #[error("factor type `{0}` is not registered in the model")]
    UnknownFactorType(String),

    #[error("weight vector has length {actual}, the model expects {expected}")]
    WeightLength { expected: usize, actual: usize },
}

// Failures of MAP inference
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error(transparent)]
    Graph(#[from] FactorGraphError),

    #[error("tree max-product requested on a graph that is not a forest")]
    NotATree,

    #[error("factor {factor} has energy {value}; energies must be finite or +inf")]
    InvalidEnergy { factor: usize, value: f64 },

    #[error("no assignment with finite energy was found after {iterations} iterations")]
    NoFiniteEnergy { iterations: usize },
}

// Failures of structured-output training
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error(transparent)]
    Graph(#[from] FactorGraphError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("inference did not converge on example {example} (gap {gap})")]
    NonConvergence { example: usize, gap: f64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("the model contains no training examples")]
    EmptyModel,
}

pub type GraphResult<T> = Result<T, FactorGraphError>;
pub type InferenceResult<T> = Result<T, InferenceError>;
pub type TrainingResult<T> = Result<T, TrainingError>;
