//! Continuous normalizing flows: exact-trace CNF and FFJORD layers

// Shared building blocks
pub mod device;
pub mod error;
pub mod linalg;

// Dynamics and Jacobian traces
pub mod dynamics;
pub mod trace;

// Base densities and ODE integration
pub mod distribution;
pub mod solver;

// Augmented state and the flow layers
pub mod cnf;
pub mod rhs;

pub use cnf::{Cnf, CnfConfig, CnfOutput, ExactTraceCnf, Ffjord};
pub use distribution::{BaseDistribution, MultivariateNormal, StandardNormal};
pub use dynamics::{AutodiffDynamics, DynamicsFunction, LinearDynamics, MlpDynamics, MlpDynamicsConfig, Pullback, VelocityField};
pub use error::{CnfError, Result};
pub use rhs::{AugmentedLayout, augmented_rhs};
pub use solver::{Dopri5, Euler, OdeSolver, Rk4, SolveStats, Solver, SolverConfig, SolverKind, TimeSpan};
pub use trace::{ExactTrace, HutchinsonTrace, ProbeKind, TraceStrategy, exact_jacobian_trace, hutchinson_trace};
