use burn::prelude::*;
use burn::tensor::backend::Backend;
use rand::RngCore;
use std::fmt;

use crate::distribution::{BaseDistribution, StandardNormal};
use crate::dynamics::DynamicsFunction;
use crate::error::{CnfError, Result as CnfResult};
use crate::linalg::count_non_finite;
use crate::rhs::{AugmentedLayout, augmented_rhs};
use crate::solver::{OdeSolver, SolveStats, Solver, SolverConfig, TimeSpan};
use crate::trace::{ExactTrace, HutchinsonTrace, ProbeKind, TraceStrategy};

/// Configuration for a continuous normalizing flow layer
#[derive(Config, Debug)]
pub struct CnfConfig {
    /// Start of the integration interval
    #[config(default = 0.0)]
    pub t0: f64,
    /// End of the integration interval, `t1 >= t0`
    #[config(default = 1.0)]
    pub t1: f64,
    #[config(default = "SolverConfig::new()")]
    pub solver: SolverConfig,
    /// Accumulate λ₁ and λ₂ (stochastic trace only)
    #[config(default = false)]
    pub regularize: bool,
    /// Distribution of probes drawn when the caller does not supply one
    #[config(default = "ProbeKind::Rademacher")]
    pub probe: ProbeKind,
    /// Fail on NaN/inf log-densities instead of returning them
    #[config(default = true)]
    pub check_finite: bool,
}

impl CnfConfig {
    /// Exact-trace layer over `dynamics` with a standard normal base
    pub fn init_exact<B: Backend, F: DynamicsFunction<B>>(&self, dynamics: F) -> CnfResult<ExactTraceCnf<B, F>> {
        self.init_with(dynamics, ExactTrace, None)
    }

    /// Hutchinson-trace (FFJORD) layer over `dynamics` with a standard normal base
    pub fn init_ffjord<B: Backend, F: DynamicsFunction<B>>(&self, dynamics: F) -> CnfResult<Ffjord<B, F>> {
        self.init_with(dynamics, HutchinsonTrace::new(self.regularize, self.probe), None)
    }

    /// Any strategy, optionally overriding the base distribution
    pub fn init_with<B, F, S>(
        &self,
        dynamics: F,
        strategy: S,
        base: Option<Box<dyn BaseDistribution<B>>>,
    ) -> CnfResult<Cnf<B, F, S>>
    where
        B: Backend,
        F: DynamicsFunction<B>,
        S: TraceStrategy,
    {
        let span = TimeSpan::new(self.t0, self.t1)?;
        let solver = self.solver.init()?;
        Ok(Cnf::new(dynamics, strategy, solver, span, base)?.with_check_finite(self.check_finite))
    }
}

/// Everything one forward pass produces
#[derive(Debug, Clone)]
pub struct CnfOutput<B: Backend> {
    /// `log p(x)`, `[1, batch]`
    pub log_density: Tensor<B, 2>,
    /// `z(t1)`, `[d, batch]`
    pub transformed: Tensor<B, 2>,
    /// Accumulated negative trace `Δlogp`, `[1, batch]`
    pub delta_logp: Tensor<B, 2>,
    /// `∫ Σ v²`, `[batch]`, zero without regularization
    pub lambda1: Tensor<B, 1>,
    /// `∫ ‖Jᵀe‖`, `[batch]`, zero without regularization
    pub lambda2: Tensor<B, 1>,
    pub stats: SolveStats,
}

/// Continuous normalizing flow
///
/// Maps data `x` at `t0` to `z(t1)` by integrating the dynamics, and
/// integrates the negative Jacobian trace alongside to get
/// `log p(x) = log p_base(z(t1)) - Δlogp`. The trace strategy `S` decides how
/// the trace is obtained and how many accumulator rows ride along.
///
/// Every forward call builds a fresh augmented state; nothing survives between
/// calls and the dynamics parameters are only read.
pub struct Cnf<B: Backend, F: DynamicsFunction<B>, S: TraceStrategy, O: OdeSolver = Solver> {
    dynamics: F,
    strategy: S,
    solver: O,
    span: TimeSpan,
    base: Box<dyn BaseDistribution<B>>,
    layout: AugmentedLayout,
    check_finite: bool,
}

/// Layer with the exact Jacobian trace
pub type ExactTraceCnf<B, F> = Cnf<B, F, ExactTrace>;

/// Layer with the Hutchinson trace estimator (FFJORD)
pub type Ffjord<B, F> = Cnf<B, F, HutchinsonTrace>;

impl<B, F, S, O> Cnf<B, F, S, O>
where
    B: Backend,
    F: DynamicsFunction<B>,
    S: TraceStrategy,
    O: OdeSolver,
{
    /// Builds the layer; without `base`, a standard normal over the dynamics
    /// input size is used and that size must be known.
    pub fn new(
        dynamics: F,
        strategy: S,
        solver: O,
        span: TimeSpan,
        base: Option<Box<dyn BaseDistribution<B>>>,
    ) -> CnfResult<Self> {
        if !span.is_forward() {
            return Err(CnfError::InvalidConfig(format!(
                "layer time span must satisfy t0 <= t1, got ({}, {})",
                span.t0(),
                span.t1()
            )));
        }

        let base: Box<dyn BaseDistribution<B>> = match base {
            Some(base) => {
                if let Some(dim) = dynamics.input_dim() {
                    if dim != base.dim() {
                        return Err(CnfError::shape("base distribution", &[dim], &[base.dim()]));
                    }
                }
                base
            }
            None => {
                let dim = dynamics.input_dim().ok_or(CnfError::DimensionInference)?;
                Box::new(StandardNormal::new(dim))
            }
        };
        let layout = AugmentedLayout::new(base.dim(), strategy.accumulators());

        log::info!(
            "built CNF: dim = {}, trace = {}, solver = {}, span = ({}, {})",
            layout.data_rows,
            strategy.name(),
            solver.name(),
            span.t0(),
            span.t1()
        );

        Ok(Self {
            dynamics,
            strategy,
            solver,
            span,
            base,
            layout,
            check_finite: true,
        })
    }

    /// Toggle the non-finite check on the log-density
    pub fn with_check_finite(mut self, check_finite: bool) -> Self {
        self.check_finite = check_finite;
        self
    }

    /// Replace the base distribution; its dimension must match the layer
    pub fn with_base(mut self, base: Box<dyn BaseDistribution<B>>) -> CnfResult<Self> {
        if base.dim() != self.layout.data_rows {
            return Err(CnfError::shape("base distribution", &[self.layout.data_rows], &[base.dim()]));
        }
        self.base = base;
        Ok(self)
    }

    /// Data dimensionality `d`
    pub fn dim(&self) -> usize {
        self.layout.data_rows
    }

    /// Integration interval of the forward pass
    pub fn span(&self) -> TimeSpan {
        self.span
    }

    /// Dynamics module, e.g. to read parameter gradients
    pub fn dynamics(&self) -> &F {
        &self.dynamics
    }

    /// Base distribution at `t1`
    pub fn base(&self) -> &dyn BaseDistribution<B> {
        self.base.as_ref()
    }

    /// Replace the dynamics with an updated module of the same type, e.g.
    /// after an optimizer step
    pub fn with_dynamics(mut self, dynamics: F) -> CnfResult<Self> {
        if let Some(dim) = dynamics.input_dim() {
            if dim != self.layout.data_rows {
                return Err(CnfError::shape("dynamics input", &[self.layout.data_rows], &[dim]));
            }
        }
        self.dynamics = dynamics;
        Ok(self)
    }

    /// Log-density of `x` (`[d, batch]`) through the flow
    ///
    /// `probe` is only used by stochastic strategies; when absent one is drawn
    /// from the thread RNG and kept fixed for the whole solve. The exact trace
    /// ignores any probe it is given.
    pub fn forward(&self, x: Tensor<B, 2>, probe: Option<Tensor<B, 2>>) -> CnfResult<CnfOutput<B>> {
        let dims = x.dims();
        if dims[0] != self.dim() {
            return Err(CnfError::shape("input data", &[self.dim(), dims[1]], &dims));
        }

        let probe = self.resolve_probe(probe, dims, &x.device())?;

        // catch shape errors before the solver starts stepping
        let v = self.dynamics.velocity(x.clone());
        if v.dims() != dims {
            return Err(CnfError::shape("dynamics output", &dims, &v.dims()));
        }

        let u0 = self.layout.initial_state(x)?;
        let (u1, stats) = self.solver.solve(
            |t, u| augmented_rhs(&self.dynamics, &self.strategy, &self.layout, t, u, probe.as_ref()),
            u0,
            self.span,
        )?;
        log::debug!(
            "{} solve: {} accepted, {} rejected, {} rhs evaluations",
            self.solver.name(),
            stats.accepted_steps,
            stats.rejected_steps,
            stats.rhs_evaluations
        );

        let parts = self.layout.split(u1)?;
        let log_density = self.base.log_density(parts.data.clone())? - parts.delta_logp.clone();

        if self.check_finite {
            let count = count_non_finite(log_density.clone())?;
            if count > 0 {
                log::warn!("log-density has {count} non-finite entries");
                return Err(CnfError::NonFiniteLogDensity { count });
            }
        }

        Ok(CnfOutput {
            log_density,
            transformed: parts.data,
            delta_logp: parts.delta_logp,
            lambda1: parts.lambda1,
            lambda2: parts.lambda2,
            stats,
        })
    }

    /// Single-vector calling convention: `x` is `[d]`, `probe` is `[d]`
    pub fn forward_vector(&self, x: Tensor<B, 1>, probe: Option<Tensor<B, 1>>) -> CnfResult<CnfOutput<B>> {
        let [d] = x.dims();
        self.forward(x.reshape([d, 1]), probe.map(|e| e.reshape([d, 1])))
    }

    /// Only the `[1, batch]` log-density row of [`Cnf::forward`]
    pub fn log_density(&self, x: Tensor<B, 2>, probe: Option<Tensor<B, 2>>) -> CnfResult<Tensor<B, 2>> {
        Ok(self.forward(x, probe)?.log_density)
    }

    /// Push data to base space without the trace accumulators
    pub fn transform(&self, x: Tensor<B, 2>) -> CnfResult<Tensor<B, 2>> {
        self.flow(x, self.span)
    }

    /// Pull base-space points back to data space
    pub fn inverse_transform(&self, z: Tensor<B, 2>) -> CnfResult<Tensor<B, 2>> {
        self.flow(z, self.span.reversed())
    }

    /// `n` draws from the base distribution, `[d, n]`
    pub fn sample_base(&self, n: usize, rng: &mut dyn RngCore, device: &B::Device) -> Tensor<B, 2> {
        self.base.sample(rng, n, device)
    }

    /// Draw `n` samples from the model as a `[d, n]` tensor
    pub fn generate(&self, n: usize, rng: &mut dyn RngCore, device: &B::Device) -> CnfResult<Tensor<B, 2>> {
        self.inverse_transform(self.sample_base(n, rng, device))
    }

    fn flow(&self, x: Tensor<B, 2>, span: TimeSpan) -> CnfResult<Tensor<B, 2>> {
        let dims = x.dims();
        if dims[0] != self.dim() {
            return Err(CnfError::shape("input data", &[self.dim(), dims[1]], &dims));
        }
        let (z, _) = self.solver.solve(
            |_t, z: Tensor<B, 2>| {
                let v = self.dynamics.velocity(z);
                if v.dims() != dims {
                    return Err(CnfError::shape("dynamics output", &dims, &v.dims()));
                }
                Ok(v)
            },
            x,
            span,
        )?;
        Ok(z)
    }

    fn resolve_probe(
        &self,
        probe: Option<Tensor<B, 2>>,
        dims: [usize; 2],
        device: &B::Device,
    ) -> CnfResult<Option<Tensor<B, 2>>> {
        let Some(kind) = self.strategy.probe_kind() else {
            if probe.is_some() {
                log::debug!("{} trace ignores the supplied probe", self.strategy.name());
            }
            return Ok(None);
        };
        match probe {
            Some(probe) if probe.dims() != dims => Err(CnfError::shape("random probe", &dims, &probe.dims())),
            Some(probe) => Ok(Some(probe)),
            None => Ok(Some(kind.sample(&mut rand::rng(), dims, device))),
        }
    }
}

impl<B, F, S, O> fmt::Debug for Cnf<B, F, S, O>
where
    B: Backend,
    F: DynamicsFunction<B>,
    S: TraceStrategy + fmt::Debug,
    O: OdeSolver + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cnf")
            .field("dim", &self.layout.data_rows)
            .field("strategy", &self.strategy)
            .field("solver", &self.solver)
            .field("span", &self.span)
            .field("check_finite", &self.check_finite)
            .finish()
    }
}
