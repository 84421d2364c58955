//! ODE integrators for `[rows, batch]` tensor states
//!
//! The right-hand side is any `FnMut(t, y) -> Result<dy/dt>`. Every stage is
//! built from ordinary tensor ops, so on an autodiff backend gradients flow
//! back through the whole solve. Step-size control reads error norms back to
//! the host and is not differentiated.

use burn::prelude::*;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::{CnfError, Result as CnfResult};
use crate::linalg::to_host;

/// Integration bounds `(t0, t1)`
///
/// The solvers integrate in either direction; `t1 < t0` runs backwards in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    t0: f64,
    t1: f64,
}

impl TimeSpan {
    pub fn new(t0: f64, t1: f64) -> CnfResult<Self> {
        if !t0.is_finite() || !t1.is_finite() {
            return Err(CnfError::InvalidConfig(format!("time span must be finite, got ({t0}, {t1})")));
        }
        Ok(Self { t0, t1 })
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn t1(&self) -> f64 {
        self.t1
    }

    /// Signed length `t1 - t0`
    pub fn duration(&self) -> f64 {
        self.t1 - self.t0
    }

    pub fn is_degenerate(&self) -> bool {
        self.t0 == self.t1
    }

    pub fn is_forward(&self) -> bool {
        self.t0 <= self.t1
    }

    /// The same interval traversed from `t1` back to `t0`
    pub fn reversed(&self) -> Self {
        Self {
            t0: self.t1,
            t1: self.t0,
        }
    }
}

/// Work done by one solve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
}

/// Integrator seam: returns the state at `span.t1()` only
pub trait OdeSolver {
    fn solve<B, F>(&self, rhs: F, y0: Tensor<B, 2>, span: TimeSpan) -> CnfResult<(Tensor<B, 2>, SolveStats)>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>;

    fn name(&self) -> &'static str;
}

/// `y + h Σ cᵢ kᵢ`, skipping zero coefficients
fn combine<B: Backend>(y: &Tensor<B, 2>, h: f64, terms: &[(f64, &Tensor<B, 2>)]) -> Tensor<B, 2> {
    terms
        .iter()
        .filter(|(c, _)| *c != 0.0)
        .fold(y.clone(), |acc, (c, k)| acc + (*k).clone().mul_scalar(h * c))
}

fn check_finite<B: Backend>(y: &Tensor<B, 2>, t: f64) -> CnfResult<()> {
    if to_host(y.clone())?.iter().any(|v| !v.is_finite()) {
        return Err(CnfError::SolverDivergence(format!("non-finite state at t = {t}")));
    }
    Ok(())
}

fn check_steps(steps: usize) -> CnfResult<()> {
    if steps == 0 {
        return Err(CnfError::InvalidConfig("fixed-step solver needs at least one step".into()));
    }
    Ok(())
}

/// Explicit Euler with a fixed number of steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Euler {
    pub steps: usize,
}

impl OdeSolver for Euler {
    fn solve<B, F>(&self, mut rhs: F, y0: Tensor<B, 2>, span: TimeSpan) -> CnfResult<(Tensor<B, 2>, SolveStats)>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>,
    {
        check_steps(self.steps)?;
        let mut stats = SolveStats::default();
        if span.is_degenerate() {
            return Ok((y0, stats));
        }

        let h = span.duration() / self.steps as f64;
        let mut y = y0;
        for i in 0..self.steps {
            let t = span.t0() + i as f64 * h;
            let k = rhs(t, y.clone())?;
            y = combine(&y, h, &[(1.0, &k)]);
            stats.accepted_steps += 1;
            stats.rhs_evaluations += 1;
        }
        check_finite(&y, span.t1())?;
        Ok((y, stats))
    }

    fn name(&self) -> &'static str {
        "euler"
    }
}

/// Classic fourth-order Runge–Kutta with a fixed number of steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rk4 {
    pub steps: usize,
}

impl OdeSolver for Rk4 {
    fn solve<B, F>(&self, mut rhs: F, y0: Tensor<B, 2>, span: TimeSpan) -> CnfResult<(Tensor<B, 2>, SolveStats)>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>,
    {
        check_steps(self.steps)?;
        let mut stats = SolveStats::default();
        if span.is_degenerate() {
            return Ok((y0, stats));
        }

        let h = span.duration() / self.steps as f64;
        let mut y = y0;
        for i in 0..self.steps {
            let t = span.t0() + i as f64 * h;
            let k1 = rhs(t, y.clone())?;
            let k2 = rhs(t + 0.5 * h, combine(&y, h, &[(0.5, &k1)]))?;
            let k3 = rhs(t + 0.5 * h, combine(&y, h, &[(0.5, &k2)]))?;
            let k4 = rhs(t + h, combine(&y, h, &[(1.0, &k3)]))?;
            y = combine(
                &y,
                h,
                &[(1.0 / 6.0, &k1), (1.0 / 3.0, &k2), (1.0 / 3.0, &k3), (1.0 / 6.0, &k4)],
            );
            stats.accepted_steps += 1;
            stats.rhs_evaluations += 4;
        }
        check_finite(&y, span.t1())?;
        Ok((y, stats))
    }

    fn name(&self) -> &'static str {
        "rk4"
    }
}

// Dormand–Prince 5(4) tableau
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A2: [f64; 1] = [1.0 / 5.0];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0];
const A5: [f64; 4] = [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0];
const A6: [f64; 5] = [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0];
const B5: [f64; 6] = [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0];
// fifth minus fourth order weights
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Adaptive Dormand–Prince 5(4) with first-same-as-last stages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dopri5 {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
    pub min_step: f64,
}

impl Default for Dopri5 {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-6,
            max_steps: 10_000,
            min_step: 1e-10,
        }
    }
}

impl Dopri5 {
    fn validate(&self) -> CnfResult<()> {
        if !(self.rtol > 0.0 && self.atol > 0.0) {
            return Err(CnfError::InvalidConfig(format!(
                "tolerances must be positive (rtol = {}, atol = {})",
                self.rtol, self.atol
            )));
        }
        if self.max_steps == 0 {
            return Err(CnfError::InvalidConfig("max_steps must be positive".into()));
        }
        Ok(())
    }

    /// RMS of `err / (atol + rtol max(|y|, |y_new|))`
    fn error_norm<B: Backend>(&self, err: Tensor<B, 2>, y: &Tensor<B, 2>, y_new: &Tensor<B, 2>) -> CnfResult<f64> {
        let scale = y
            .clone()
            .abs()
            .max_pair(y_new.clone().abs())
            .mul_scalar(self.rtol)
            .add_scalar(self.atol);
        rms(err / scale)
    }

    /// Hairer–Wanner starting step from two derivative evaluations
    fn initial_step<B, F>(&self, rhs: &mut F, t0: f64, y0: &Tensor<B, 2>, f0: &Tensor<B, 2>, span: f64) -> CnfResult<f64>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>,
    {
        let scale = y0.clone().abs().mul_scalar(self.rtol).add_scalar(self.atol);
        let d0 = rms(y0.clone() / scale.clone())?;
        let d1 = rms(f0.clone() / scale.clone())?;
        let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };

        let direction = span.signum();
        let y1 = combine(y0, direction * h0, &[(1.0, f0)]);
        let f1 = rhs(t0 + direction * h0, y1)?;
        let d2 = rms((f1 - f0.clone()) / scale)? / h0;

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / 5.0)
        };
        Ok((100.0 * h0).min(h1).min(span.abs()))
    }
}

fn rms<B: Backend>(x: Tensor<B, 2>) -> CnfResult<f64> {
    let values = to_host(x)?;
    if values.is_empty() {
        return Ok(0.0);
    }
    Ok((values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt())
}

impl OdeSolver for Dopri5 {
    fn solve<B, F>(&self, mut rhs: F, y0: Tensor<B, 2>, span: TimeSpan) -> CnfResult<(Tensor<B, 2>, SolveStats)>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>,
    {
        self.validate()?;
        let mut stats = SolveStats::default();
        if span.is_degenerate() {
            return Ok((y0, stats));
        }

        let direction = span.duration().signum();
        let mut t = span.t0();
        let mut y = y0;
        let mut k1 = rhs(t, y.clone())?;
        let mut h = self.initial_step(&mut rhs, t, &y, &k1, span.duration())?;
        stats.rhs_evaluations += 2;

        while (span.t1() - t) * direction > 0.0 {
            if stats.accepted_steps + stats.rejected_steps >= self.max_steps {
                return Err(CnfError::SolverDivergence(format!(
                    "exceeded {} steps at t = {t}",
                    self.max_steps
                )));
            }
            // land exactly on t1
            let remaining = (span.t1() - t).abs();
            // a short final stretch is not an underflow
            if h < self.min_step && h < remaining {
                return Err(CnfError::SolverDivergence(format!("step size underflow ({h:e}) at t = {t}")));
            }
            let last = h >= remaining;
            let step = direction * if last { remaining } else { h };

            let k2 = rhs(t + C[1] * step, combine(&y, step, &[(A2[0], &k1)]))?;
            let k3 = rhs(t + C[2] * step, combine(&y, step, &[(A3[0], &k1), (A3[1], &k2)]))?;
            let k4 = rhs(
                t + C[3] * step,
                combine(&y, step, &[(A4[0], &k1), (A4[1], &k2), (A4[2], &k3)]),
            )?;
            let k5 = rhs(
                t + C[4] * step,
                combine(&y, step, &[(A5[0], &k1), (A5[1], &k2), (A5[2], &k3), (A5[3], &k4)]),
            )?;
            let k6 = rhs(
                t + C[5] * step,
                combine(
                    &y,
                    step,
                    &[(A6[0], &k1), (A6[1], &k2), (A6[2], &k3), (A6[3], &k4), (A6[4], &k5)],
                ),
            )?;
            let y_new = combine(
                &y,
                step,
                &[(B5[0], &k1), (B5[2], &k3), (B5[3], &k4), (B5[4], &k5), (B5[5], &k6)],
            );
            let k7 = rhs(t + C[6] * step, y_new.clone())?;
            stats.rhs_evaluations += 6;

            let err = combine(
                &k1.zeros_like(),
                step,
                &[(E[0], &k1), (E[2], &k3), (E[3], &k4), (E[4], &k5), (E[5], &k6), (E[6], &k7)],
            );
            let norm = self.error_norm(err, &y, &y_new)?;

            if norm.is_finite() && norm <= 1.0 {
                t = if last { span.t1() } else { t + step };
                y = y_new;
                k1 = k7;
                stats.accepted_steps += 1;
                let factor = if norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                h = step.abs() * factor;
            } else {
                stats.rejected_steps += 1;
                let factor = if norm.is_finite() {
                    (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, 1.0)
                } else {
                    MIN_FACTOR
                };
                log::trace!("dopri5 rejected step {:e} at t = {t} (error norm {norm:e})", step.abs());
                h = step.abs() * factor;
            }
        }

        check_finite(&y, t)?;
        Ok((y, stats))
    }

    fn name(&self) -> &'static str {
        "dopri5"
    }
}

/// Integrator families selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    Euler,
    Rk4,
    Dopri5,
}

/// Configuration for the ODE solver used by a CNF layer
#[derive(Config, Debug)]
pub struct SolverConfig {
    #[config(default = "SolverKind::Dopri5")]
    pub kind: SolverKind,
    /// Relative tolerance (adaptive solvers)
    #[config(default = 1e-5)]
    pub rtol: f64,
    /// Absolute tolerance (adaptive solvers)
    #[config(default = 1e-6)]
    pub atol: f64,
    /// Step budget for adaptive solvers
    #[config(default = 10000)]
    pub max_steps: usize,
    /// Smallest step before declaring divergence
    #[config(default = 1e-10)]
    pub min_step: f64,
    /// Number of steps for fixed-step solvers
    #[config(default = 100)]
    pub fixed_steps: usize,
}

impl SolverConfig {
    /// Returns the configured solver after validating its parameters
    pub fn init(&self) -> CnfResult<Solver> {
        let solver = match self.kind {
            SolverKind::Euler => Solver::Euler(Euler {
                steps: self.fixed_steps,
            }),
            SolverKind::Rk4 => Solver::Rk4(Rk4 {
                steps: self.fixed_steps,
            }),
            SolverKind::Dopri5 => {
                let dopri = Dopri5 {
                    rtol: self.rtol,
                    atol: self.atol,
                    max_steps: self.max_steps,
                    min_step: self.min_step,
                };
                dopri.validate()?;
                Solver::Dopri5(dopri)
            }
        };
        if let Solver::Euler(Euler { steps }) | Solver::Rk4(Rk4 { steps }) = solver {
            check_steps(steps)?;
        }
        Ok(solver)
    }
}

/// Any of the built-in integrators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Solver {
    Euler(Euler),
    Rk4(Rk4),
    Dopri5(Dopri5),
}

impl Default for Solver {
    fn default() -> Self {
        Solver::Dopri5(Dopri5::default())
    }
}

impl OdeSolver for Solver {
    fn solve<B, F>(&self, rhs: F, y0: Tensor<B, 2>, span: TimeSpan) -> CnfResult<(Tensor<B, 2>, SolveStats)>
    where
        B: Backend,
        F: FnMut(f64, Tensor<B, 2>) -> CnfResult<Tensor<B, 2>>,
    {
        match self {
            Solver::Euler(s) => s.solve(rhs, y0, span),
            Solver::Rk4(s) => s.solve(rhs, y0, span),
            Solver::Dopri5(s) => s.solve(rhs, y0, span),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Solver::Euler(s) => s.name(),
            Solver::Rk4(s) => s.name(),
            Solver::Dopri5(s) => s.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend as TestBackend, init_device};
    use crate::linalg::matrix;

    fn decay(_t: f64, y: Tensor<TestBackend, 2>) -> CnfResult<Tensor<TestBackend, 2>> {
        Ok(y.neg())
    }

    fn y0() -> Tensor<TestBackend, 2> {
        matrix(vec![1.0, 2.0], 1, 2, &init_device())
    }

    #[test]
    fn test_rk4_matches_exponential_decay() {
        let span = TimeSpan::new(0.0, 1.0).unwrap();
        let (y, stats) = Rk4 { steps: 20 }.solve(decay, y0(), span).unwrap();

        let values = to_host(y).unwrap();
        let expected = (-1.0_f64).exp();
        assert!((values[0] - expected).abs() < 1e-5);
        assert!((values[1] - 2.0 * expected).abs() < 1e-5);
        assert_eq!(stats.rhs_evaluations, 80);
    }

    #[test]
    fn test_dopri5_matches_exponential_decay() {
        let span = TimeSpan::new(0.0, 2.0).unwrap();
        let (y, stats) = Dopri5::default().solve(decay, y0(), span).unwrap();

        let values = to_host(y).unwrap();
        let expected = (-2.0_f64).exp();
        assert!((values[0] - expected).abs() < 1e-4, "got {}", values[0]);
        assert!(stats.accepted_steps > 0);
    }

    #[test]
    fn test_dopri5_runs_backwards() {
        let span = TimeSpan::new(1.0, 0.0).unwrap();
        let (y, _) = Dopri5::default().solve(decay, y0(), span).unwrap();

        // dy/dt = -y backwards over one unit grows by e
        let values = to_host(y).unwrap();
        assert!((values[0] - 1.0_f64.exp()).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_span_returns_input() {
        let span = TimeSpan::new(0.5, 0.5).unwrap();
        for solver in [Solver::Euler(Euler { steps: 3 }), Solver::Rk4(Rk4 { steps: 3 }), Solver::default()] {
            let (y, stats) = solver.solve(decay, y0(), span).unwrap();
            assert_eq!(to_host(y).unwrap(), vec![1.0, 2.0]);
            assert_eq!(stats.rhs_evaluations, 0);
        }
    }

    #[test]
    fn test_dopri5_reports_blow_up() {
        // dy/dt = y^2 from y = 1 explodes at t = 1
        let span = TimeSpan::new(0.0, 2.0).unwrap();
        let solver = Dopri5 {
            max_steps: 500,
            ..Dopri5::default()
        };
        let result = solver.solve(|_t, y: Tensor<TestBackend, 2>| Ok(y.clone() * y), y0(), span);

        assert!(matches!(result, Err(CnfError::SolverDivergence(_))));
    }

    #[test]
    fn test_dopri5_span_shorter_than_min_step() {
        let span = TimeSpan::new(0.0, 1e-12).unwrap();
        let (y, stats) = Dopri5::default().solve(decay, y0(), span).unwrap();

        assert_eq!(stats.accepted_steps, 1);
        let values = to_host(y).unwrap();
        assert!((values[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_euler_first_order_error() {
        let span = TimeSpan::new(0.0, 1.0).unwrap();
        let (y, _) = Euler { steps: 1000 }.solve(decay, y0(), span).unwrap();

        let err = (to_host(y).unwrap()[0] - (-1.0_f64).exp()).abs();
        assert!(err < 1e-3 && err > 1e-6);
    }

    #[test]
    fn test_config_builds_solvers() {
        let solver = SolverConfig::new().with_kind(SolverKind::Rk4).with_fixed_steps(8).init().unwrap();
        assert_eq!(solver, Solver::Rk4(Rk4 { steps: 8 }));

        assert!(SolverConfig::new().with_rtol(0.0).init().is_err());
        assert!(SolverConfig::new().with_kind(SolverKind::Euler).with_fixed_steps(0).init().is_err());
    }

    #[test]
    fn test_time_span_rejects_nan() {
        assert!(TimeSpan::new(0.0, f64::NAN).is_err());
        let span = TimeSpan::new(0.0, 1.0).unwrap();
        assert_eq!(span.reversed().t0(), 1.0);
        assert!(!span.reversed().is_forward());
    }
}
