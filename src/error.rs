//! Error types for the CNF layers

use thiserror::Error;

/// Errors raised while building or evaluating a continuous normalizing flow
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CnfError {
    /// A tensor did not have the shape the computation requires
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The ODE solver failed (step underflow, step budget, non-finite state)
    #[error("solver divergence: {0}")]
    SolverDivergence(String),

    /// No base distribution was given and the dynamics input size is unknown
    #[error("cannot infer state dimensionality: dynamics has no fixed input size and no base distribution was given")]
    DimensionInference,

    /// The computed log-density contains NaN or infinite entries
    #[error("log-density has {count} non-finite entries")]
    NonFiniteLogDensity { count: usize },

    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor data could not be read back to the host
    #[error("tensor data error: {0}")]
    Data(String),
}

impl CnfError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CnfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_names_context() {
        let err = CnfError::shape("augmented state", &[3, 2], &[4, 2]);
        let msg = err.to_string();
        assert!(msg.contains("augmented state"));
        assert!(msg.contains("[3, 2]"));
        assert!(msg.contains("[4, 2]"));
    }
}
