//! Augmented state bookkeeping and the augmented right-hand side
//!
//! Row layout of the augmented state `[d + K, batch]`:
//! data rows `0..d`, then `-∫tr` at row `d`, then `λ₁`, `λ₂` when `K == 3`.

use burn::prelude::*;
use burn::tensor::backend::Backend;

use crate::dynamics::DynamicsFunction;
use crate::error::{CnfError, Result};
use crate::linalg::row_to_vector;
use crate::trace::TraceStrategy;

/// Row layout of an augmented state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AugmentedLayout {
    pub data_rows: usize,
    pub accumulators: usize,
}

/// Pieces of a final augmented state
#[derive(Debug, Clone)]
pub struct AugmentedParts<B: Backend> {
    /// `[d, batch]`
    pub data: Tensor<B, 2>,
    /// Accumulated negative trace, `[1, batch]`
    pub delta_logp: Tensor<B, 2>,
    /// `[batch]`, zeros without regularization
    pub lambda1: Tensor<B, 1>,
    /// `[batch]`, zeros without regularization
    pub lambda2: Tensor<B, 1>,
}

impl AugmentedLayout {
    pub fn new(data_rows: usize, accumulators: usize) -> Self {
        Self {
            data_rows,
            accumulators,
        }
    }

    pub fn rows(&self) -> usize {
        self.data_rows + self.accumulators
    }

    pub fn check<B: Backend>(&self, u: &Tensor<B, 2>) -> Result<()> {
        let [rows, batch] = u.dims();
        if rows != self.rows() {
            return Err(CnfError::shape("augmented state", &[self.rows(), batch], &[rows, batch]));
        }
        Ok(())
    }

    /// `x` stacked over `K` zero accumulator rows
    ///
    /// The zeros are fresh constants with no autodiff history.
    pub fn initial_state<B: Backend>(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [rows, batch] = x.dims();
        if rows != self.data_rows {
            return Err(CnfError::shape("input data", &[self.data_rows, batch], &[rows, batch]));
        }
        let zeros = Tensor::zeros([self.accumulators, batch], &x.device());
        Ok(Tensor::cat(vec![x, zeros], 0))
    }

    /// Data rows of an augmented state
    pub fn data<B: Backend>(&self, u: Tensor<B, 2>) -> Tensor<B, 2> {
        let [_, batch] = u.dims();
        u.slice([0..self.data_rows, 0..batch])
    }

    /// Split a final augmented state into its parts
    pub fn split<B: Backend>(&self, u: Tensor<B, 2>) -> Result<AugmentedParts<B>> {
        self.check(&u)?;
        let [_, batch] = u.dims();
        let d = self.data_rows;
        let row = |i: usize| row_to_vector(u.clone().slice([i..i + 1, 0..batch]));

        let (lambda1, lambda2) = if self.accumulators >= 3 {
            (row(d + 1), row(d + 2))
        } else {
            let zeros = Tensor::zeros([batch], &u.device());
            (zeros.clone(), zeros)
        };

        Ok(AugmentedParts {
            data: u.clone().slice([0..d, 0..batch]),
            delta_logp: u.slice([d..d + 1, 0..batch]),
            lambda1,
            lambda2,
        })
    }
}

/// Time derivative of the augmented state
///
/// Accumulator rows of `u` are discarded; their derivative depends only on
/// the data rows. `_t` is unused because the dynamics are autonomous.
pub fn augmented_rhs<B, F, S>(
    dynamics: &F,
    strategy: &S,
    layout: &AugmentedLayout,
    _t: f64,
    u: Tensor<B, 2>,
    probe: Option<&Tensor<B, 2>>,
) -> Result<Tensor<B, 2>>
where
    B: Backend,
    F: DynamicsFunction<B> + ?Sized,
    S: TraceStrategy,
{
    layout.check(&u)?;
    let dims = u.dims();
    let z = layout.data(u);

    let du = strategy.augmented_derivative(dynamics, z, probe)?;
    if du.dims() != dims {
        return Err(CnfError::shape("augmented derivative", &dims, &du.dims()));
    }
    Ok(du)
}
