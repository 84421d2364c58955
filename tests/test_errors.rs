use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use cnf_rust::device::{AutodiffBackend, Backend as TestBackend, init_device};
use cnf_rust::linalg::{matrix, to_host};
use cnf_rust::{
    AutodiffDynamics, CnfConfig, CnfError, LinearDynamics, SolverConfig, SolverKind, VelocityField,
    exact_jacobian_trace,
};

/// Drops the last state row, so output and input shapes disagree
struct TruncatingField {
    dim: usize,
}

impl<B: Backend> VelocityField<B> for TruncatingField {
    fn forward_velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let [rows, batch] = z.dims();
        z.slice([0..rows - 1, 0..batch])
    }

    fn state_dim(&self) -> Option<usize> {
        Some(self.dim)
    }
}

#[test]
fn test_dynamics_output_shape_mismatch() {
    let device = init_device();
    let dynamics = AutodiffDynamics::<AutodiffBackend, _>::new(TruncatingField { dim: 3 });
    let cnf = CnfConfig::new().init_exact(dynamics).unwrap();

    let x = Tensor::<TestBackend, 2>::ones([3, 2], &device);
    match cnf.forward(x, None) {
        Err(CnfError::ShapeMismatch { context, expected, actual }) => {
            assert_eq!(context, "dynamics output");
            assert_eq!(expected, vec![3, 2]);
            assert_eq!(actual, vec![2, 2]);
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }

    println!("✅ Dynamics output shape mismatch reported!");
}

#[test]
fn test_exact_trace_rejects_mismatched_dynamics() {
    let device = init_device();
    let dynamics = AutodiffDynamics::<AutodiffBackend, _>::new(TruncatingField { dim: 2 });
    let z = Tensor::<TestBackend, 2>::zeros([2, 4], &device);

    assert!(matches!(
        exact_jacobian_trace(&dynamics, z),
        Err(CnfError::ShapeMismatch { .. })
    ));
}

/// `v = 50 z` over (0, 1): z(1) ≈ 5e21 stays finite in f32 but z² does not
fn overflowing_config() -> CnfConfig {
    CnfConfig::new().with_solver(SolverConfig::new().with_kind(SolverKind::Rk4).with_fixed_steps(200))
}

fn fast_growth() -> LinearDynamics<TestBackend> {
    LinearDynamics::new(matrix(vec![50.0], 1, 1, &init_device()), None).unwrap()
}

#[test]
fn test_non_finite_log_density_is_an_error() {
    let device = init_device();
    let cnf = overflowing_config().init_exact(fast_growth()).unwrap();

    let result = cnf.forward(matrix(vec![1.0, 0.0], 1, 2, &device), None);
    assert!(
        matches!(result, Err(CnfError::NonFiniteLogDensity { count: 1 })),
        "{result:?}"
    );

    println!("✅ Non-finite log-density reported!");
}

#[test]
fn test_non_finite_check_can_be_disabled() {
    let device = init_device();
    let x = matrix::<TestBackend>(vec![1.0, 0.0], 1, 2, &device);

    let from_config = overflowing_config().with_check_finite(false).init_exact(fast_growth()).unwrap();
    let from_builder = overflowing_config().init_exact(fast_growth()).unwrap().with_check_finite(false);

    for cnf in [from_config, from_builder] {
        let out = cnf.forward(x.clone(), None).unwrap();
        assert!(to_host(out.transformed).unwrap().iter().all(|z| z.is_finite()));

        let lp = to_host(out.log_density).unwrap();
        assert_eq!(lp[0], f64::NEG_INFINITY);
        assert!(lp[1].is_finite());
    }
}
