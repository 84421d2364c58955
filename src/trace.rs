//! Jacobian trace computation: exact and Hutchinson estimator
//!
//! Both paths work on `[d, batch]` states and return one trace per column as a
//! `[1, batch]` row.

use burn::prelude::*;
use burn::tensor::backend::Backend;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::dynamics::DynamicsFunction;
use crate::error::{CnfError, Result};
use crate::linalg::{basis_cotangent, batched_trace, column_dot, column_norm, column_squared_norm, matrix};

/// Velocity, full Jacobian and its trace at one state
#[derive(Debug, Clone)]
pub struct ExactJacobian<B: Backend> {
    /// `[d, batch]`
    pub velocity: Tensor<B, 2>,
    /// `[d, d, batch]`, entry `[i, j, b] = ∂v_i/∂z_j` for column `b`
    pub jacobian: Tensor<B, 3>,
    /// `[1, batch]`
    pub trace: Tensor<B, 2>,
}

/// Exact Jacobian via `d` vector-Jacobian products against one-hot cotangents
///
/// Pullback `i` returns row `i` of the Jacobian for every batch column at once.
/// Cost is one forward pass plus `d` reverse passes.
pub fn exact_jacobian_trace<B: Backend, F: DynamicsFunction<B> + ?Sized>(
    dynamics: &F,
    z: Tensor<B, 2>,
) -> Result<ExactJacobian<B>> {
    let dims = z.dims();
    let [d, batch] = dims;
    let device = z.device();

    let (velocity, pullback) = dynamics.vjp(z);
    if velocity.dims() != dims {
        return Err(CnfError::shape("dynamics output", &dims, &velocity.dims()));
    }

    let rows: Vec<Tensor<B, 2>> = (0..d)
        .map(|i| pullback.apply(basis_cotangent(d, batch, i, &device)))
        .collect();
    let jacobian = Tensor::stack::<3>(rows, 0);
    let trace = batched_trace(jacobian.clone());

    Ok(ExactJacobian {
        velocity,
        jacobian,
        trace,
    })
}

/// Single-vector form of [`exact_jacobian_trace`]: returns `([d, d], trace)`
pub fn exact_jacobian_trace_vector<B: Backend, F: DynamicsFunction<B> + ?Sized>(
    dynamics: &F,
    z: Tensor<B, 1>,
) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
    let [d] = z.dims();
    let exact = exact_jacobian_trace(dynamics, z.reshape([d, 1]))?;
    Ok((exact.jacobian.reshape([d, d]), exact.trace.reshape([1])))
}

/// Result of one Hutchinson evaluation
#[derive(Debug, Clone)]
pub struct HutchinsonEstimate<B: Backend> {
    /// `[d, batch]`
    pub velocity: Tensor<B, 2>,
    /// `[1, batch]`, unbiased over probe draws
    pub trace: Tensor<B, 2>,
    /// `Jᵀe`, `[d, batch]`
    pub vjp: Tensor<B, 2>,
}

/// Hutchinson trace estimate `eᵀ J e` with a single reverse pass
pub fn hutchinson_trace<B: Backend, F: DynamicsFunction<B> + ?Sized>(
    dynamics: &F,
    z: Tensor<B, 2>,
    probe: Tensor<B, 2>,
) -> Result<HutchinsonEstimate<B>> {
    let dims = z.dims();
    if probe.dims() != dims {
        return Err(CnfError::shape("random probe", &dims, &probe.dims()));
    }

    let (velocity, pullback) = dynamics.vjp(z);
    if velocity.dims() != dims {
        return Err(CnfError::shape("dynamics output", &dims, &velocity.dims()));
    }

    let vjp = pullback.apply(probe.clone());
    let trace = column_dot(vjp.clone(), probe);

    Ok(HutchinsonEstimate { velocity, trace, vjp })
}

/// Distribution of the Hutchinson probe entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Independent ±1 entries
    #[default]
    Rademacher,
    /// Independent standard normal entries
    Gaussian,
}

impl ProbeKind {
    /// Draw a `[rows, batch]` probe; `E[e eᵀ] = I` for both kinds
    pub fn sample<B: Backend, R: Rng>(
        &self,
        rng: &mut R,
        dims: [usize; 2],
        device: &B::Device,
    ) -> Tensor<B, 2> {
        let [rows, batch] = dims;
        let values: Vec<f64> = (0..rows * batch)
            .map(|_| match self {
                ProbeKind::Rademacher => {
                    if rng.random::<bool>() { 1.0 } else { -1.0 }
                }
                ProbeKind::Gaussian => rng.sample::<f64, _>(StandardNormal),
            })
            .collect();
        matrix(values, rows, batch, device)
    }
}

/// How the augmented right-hand side obtains `tr(∂v/∂z)`
///
/// Implementations decide how many accumulator rows sit under the data rows
/// and fill their derivatives.
pub trait TraceStrategy {
    /// Number of accumulator rows `K`
    fn accumulators(&self) -> usize;

    /// Probe distribution when the strategy is stochastic
    fn probe_kind(&self) -> Option<ProbeKind>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;

    /// Time derivative of the augmented state for data state `z`:
    /// `[d + K, batch]` with rows `v`, `-trace`, then any regularizers
    fn augmented_derivative<B: Backend, F: DynamicsFunction<B> + ?Sized>(
        &self,
        dynamics: &F,
        z: Tensor<B, 2>,
        probe: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>>;
}

/// Exact trace from the full Jacobian, one accumulator row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExactTrace;

impl TraceStrategy for ExactTrace {
    fn accumulators(&self) -> usize {
        1
    }

    fn probe_kind(&self) -> Option<ProbeKind> {
        None
    }

    fn name(&self) -> &'static str {
        "exact"
    }

    fn augmented_derivative<B: Backend, F: DynamicsFunction<B> + ?Sized>(
        &self,
        dynamics: &F,
        z: Tensor<B, 2>,
        _probe: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        let exact = exact_jacobian_trace(dynamics, z)?;
        Ok(Tensor::cat(vec![exact.velocity, exact.trace.neg()], 0))
    }
}

/// Hutchinson estimator (FFJORD), optionally with the two regularizers
///
/// With `regularize` the accumulator rows are `-trace`, `λ₁ = Σ v²` and
/// `λ₂ = ‖Jᵀe‖`, in that order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HutchinsonTrace {
    pub regularize: bool,
    pub probe: ProbeKind,
}

impl HutchinsonTrace {
    pub fn new(regularize: bool, probe: ProbeKind) -> Self {
        Self { regularize, probe }
    }
}

impl TraceStrategy for HutchinsonTrace {
    fn accumulators(&self) -> usize {
        if self.regularize { 3 } else { 1 }
    }

    fn probe_kind(&self) -> Option<ProbeKind> {
        Some(self.probe)
    }

    fn name(&self) -> &'static str {
        if self.regularize { "hutchinson+reg" } else { "hutchinson" }
    }

    fn augmented_derivative<B: Backend, F: DynamicsFunction<B> + ?Sized>(
        &self,
        dynamics: &F,
        z: Tensor<B, 2>,
        probe: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        let probe = probe
            .ok_or_else(|| CnfError::InvalidConfig("Hutchinson trace requires a random probe".into()))?;
        let estimate = hutchinson_trace(dynamics, z, probe.clone())?;

        let mut rows = vec![estimate.velocity.clone(), estimate.trace.neg()];
        if self.regularize {
            // reuse Jᵀe from the estimator instead of another reverse pass
            rows.push(column_squared_norm(estimate.velocity));
            rows.push(column_norm(estimate.vjp));
        }
        Ok(Tensor::cat(rows, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend as TestBackend, init_device};
    use crate::dynamics::LinearDynamics;
    use crate::linalg::to_host;
    use rand::{SeedableRng, rngs::StdRng};

    fn linear(values: Vec<f64>, d: usize) -> LinearDynamics<TestBackend> {
        let device = init_device();
        LinearDynamics::new(matrix(values, d, d, &device), None).unwrap()
    }

    #[test]
    fn test_exact_jacobian_recovers_weight() {
        let device = init_device();
        let a = vec![1.0, -2.0, 0.5, 3.0];
        let dynamics = linear(a.clone(), 2);
        let z = Tensor::<TestBackend, 2>::ones([2, 3], &device);

        let exact = exact_jacobian_trace(&dynamics, z).unwrap();
        assert_eq!(exact.jacobian.dims(), [2, 2, 3]);
        assert_eq!(to_host(exact.trace).unwrap(), vec![4.0, 4.0, 4.0]);

        // column 0 of the jacobian tensor is A itself
        let first = to_host(exact.jacobian.slice([0..2, 0..2, 0..1])).unwrap();
        assert_eq!(first, a);
    }

    #[test]
    fn test_exact_vector_form() {
        let device = init_device();
        let dynamics = linear(vec![0.25], 1);

        let (jac, trace) = exact_jacobian_trace_vector(&dynamics, Tensor::from_floats([2.0], &device)).unwrap();
        assert_eq!(jac.dims(), [1, 1]);
        assert_eq!(to_host(trace).unwrap(), vec![0.25]);
    }

    #[test]
    fn test_hutchinson_is_exact_for_diagonal_with_rademacher() {
        let device = init_device();
        let dynamics = linear(vec![2.0, 0.0, 0.0, -0.5], 2);
        let mut rng = StdRng::seed_from_u64(7);
        let probe = ProbeKind::Rademacher.sample::<TestBackend, _>(&mut rng, [2, 4], &device);
        let z = Tensor::<TestBackend, 2>::zeros([2, 4], &device);

        let estimate = hutchinson_trace(&dynamics, z, probe).unwrap();
        for value in to_host(estimate.trace).unwrap() {
            assert!((value - 1.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_hutchinson_rejects_probe_shape() {
        let device = init_device();
        let dynamics = linear(vec![1.0, 0.0, 0.0, 1.0], 2);
        let z = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let probe = Tensor::<TestBackend, 2>::ones([2, 2], &device);

        assert!(matches!(
            hutchinson_trace(&dynamics, z, probe),
            Err(CnfError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rademacher_entries_are_signs() {
        let device = init_device();
        let mut rng = StdRng::seed_from_u64(11);
        let probe = ProbeKind::Rademacher.sample::<TestBackend, _>(&mut rng, [3, 5], &device);

        assert!(to_host(probe).unwrap().iter().all(|v| v.abs() == 1.0));
    }

    #[test]
    fn test_regularized_rows() {
        let device = init_device();
        let dynamics = linear(vec![1.0, 0.0, 0.0, 1.0], 2);
        let strategy = HutchinsonTrace::new(true, ProbeKind::Rademacher);
        let z = matrix::<TestBackend>(vec![3.0, 4.0], 2, 1, &device);
        let probe = matrix::<TestBackend>(vec![1.0, -1.0], 2, 1, &device);

        let du = strategy.augmented_derivative(&dynamics, z, Some(&probe)).unwrap();
        let values = to_host(du).unwrap();

        // v = z, -trace = -2, λ₁ = 9 + 16, λ₂ = ‖e‖ = √2
        assert_eq!(values.len(), 5);
        assert_eq!(&values[..4], &[3.0, 4.0, -2.0, 25.0]);
        assert!((values[4] - 2.0_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_hutchinson_strategy_requires_probe() {
        let device = init_device();
        let dynamics = linear(vec![1.0], 1);
        let z = Tensor::<TestBackend, 2>::zeros([1, 1], &device);

        let result = HutchinsonTrace::default().augmented_derivative(&dynamics, z, None);
        assert!(matches!(result, Err(CnfError::InvalidConfig(_))));
    }
}
