//! Base distributions of the flow
//!
//! Log-densities are evaluated per column of a `[d, batch]` tensor and
//! returned as `[1, batch]` rows in the backend's float precision. Constant
//! terms are computed on the host in f64 and cast in when added.

use burn::prelude::*;
use burn::tensor::backend::Backend;
use nalgebra::DMatrix;
use rand::RngCore;

use crate::error::{CnfError, Result};
use crate::linalg::{column_squared_norm, matrix};
use crate::trace::ProbeKind;

/// `ln(2π)`
const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Density the flow maps onto
pub trait BaseDistribution<B: Backend> {
    /// Dimensionality `d` of the un-augmented state
    fn dim(&self) -> usize;

    /// `log p(z)` per column: `[d, batch] -> [1, batch]`
    fn log_density(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>>;

    /// Draw `n` samples as a `[d, n]` tensor
    fn sample(&self, rng: &mut dyn RngCore, n: usize, device: &B::Device) -> Tensor<B, 2>;
}

fn check_rows<B: Backend>(z: &Tensor<B, 2>, dim: usize) -> Result<()> {
    let [rows, batch] = z.dims();
    if rows != dim {
        return Err(CnfError::shape("base distribution input", &[dim, batch], &[rows, batch]));
    }
    Ok(())
}

/// Standard multivariate normal `N(0, I)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardNormal {
    dim: usize,
}

impl StandardNormal {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl<B: Backend> BaseDistribution<B> for StandardNormal {
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_density(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        check_rows(&z, self.dim)?;
        let log_norm = -0.5 * self.dim as f64 * LN_2PI;
        Ok(column_squared_norm(z).mul_scalar(-0.5).add_scalar(log_norm))
    }

    fn sample(&self, mut rng: &mut dyn RngCore, n: usize, device: &B::Device) -> Tensor<B, 2> {
        ProbeKind::Gaussian.sample(&mut rng, [self.dim, n], device)
    }
}

/// Multivariate normal `N(μ, Σ)` with a user supplied covariance
///
/// `Σ = L Lᵀ` is factorized once at construction; evaluation whitens with
/// `L⁻¹`.
#[derive(Debug, Clone)]
pub struct MultivariateNormal<B: Backend> {
    dim: usize,
    mean: Tensor<B, 2>,
    cholesky: Tensor<B, 2>,
    inverse_cholesky: Tensor<B, 2>,
    log_norm: f64,
}

impl<B: Backend> MultivariateNormal<B> {
    /// `mean` has `d` entries, `covariance` is row-major `d × d`
    pub fn new(mean: Vec<f64>, covariance: Vec<f64>, device: &B::Device) -> Result<Self> {
        let dim = mean.len();
        if dim == 0 {
            return Err(CnfError::InvalidConfig("multivariate normal needs at least one dimension".into()));
        }
        if covariance.len() != dim * dim {
            return Err(CnfError::shape("covariance", &[dim * dim], &[covariance.len()]));
        }

        let sigma = DMatrix::from_row_slice(dim, dim, &covariance);
        if (&sigma - sigma.transpose()).amax() > 1e-10 * sigma.amax().max(1.0) {
            return Err(CnfError::InvalidConfig("covariance must be symmetric".into()));
        }
        let l = sigma
            .cholesky()
            .ok_or_else(|| CnfError::InvalidConfig("covariance must be positive definite".into()))?
            .l();
        let l_inv = l
            .solve_lower_triangular(&DMatrix::identity(dim, dim))
            .ok_or_else(|| CnfError::InvalidConfig("covariance factor is singular".into()))?;

        let log_det = 2.0 * l.diagonal().iter().map(|v| v.ln()).sum::<f64>();
        let log_norm = -0.5 * (dim as f64 * LN_2PI + log_det);

        Ok(Self {
            dim,
            mean: matrix(mean, dim, 1, device),
            cholesky: matrix(row_major(&l), dim, dim, device),
            inverse_cholesky: matrix(row_major(&l_inv), dim, dim, device),
            log_norm,
        })
    }

    /// Isotropic `N(μ, σ² I)`
    pub fn isotropic(mean: Vec<f64>, sigma: f64, device: &B::Device) -> Result<Self> {
        let dim = mean.len();
        let mut covariance = vec![0.0; dim * dim];
        for i in 0..dim {
            covariance[i * dim + i] = sigma * sigma;
        }
        Self::new(mean, covariance, device)
    }
}

fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    m.transpose().as_slice().to_vec()
}

impl<B: Backend> BaseDistribution<B> for MultivariateNormal<B> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_density(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        check_rows(&z, self.dim)?;
        let whitened = self.inverse_cholesky.clone().matmul(z - self.mean.clone());
        Ok(column_squared_norm(whitened).mul_scalar(-0.5).add_scalar(self.log_norm))
    }

    fn sample(&self, mut rng: &mut dyn RngCore, n: usize, device: &B::Device) -> Tensor<B, 2> {
        let eps = ProbeKind::Gaussian.sample::<B, _>(&mut rng, [self.dim, n], device);
        self.cholesky.clone().matmul(eps) + self.mean.clone()
    }
}
