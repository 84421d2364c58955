//! Batched linear-algebra helpers over `[rows, batch]` tensors
//!
//! Every batch element is a column. Reductions therefore run over dim 0 and
//! return `[1, batch]` row vectors.

use burn::prelude::*;
use burn::tensor::{TensorData, backend::Backend};

use crate::error::{CnfError, Result};

/// Build a `[rows, cols]` float tensor from row-major host values
pub fn matrix<B: Backend>(values: Vec<f64>, rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2> {
    let data = TensorData::new(values, [rows, cols]).convert::<B::FloatElem>();
    Tensor::from_data(data, device)
}

/// Per-column sum of squares: `[d, batch] -> [1, batch]`
pub fn column_squared_norm<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    (x.clone() * x).sum_dim(0)
}

/// Per-column Euclidean norm: `[d, batch] -> [1, batch]`
///
/// Zero columns are masked around the `sqrt`, so their gradient is zero
/// instead of `0 * inf`.
pub fn column_norm<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let squared = column_squared_norm(x);
    let zero = squared.clone().equal_elem(0.0);
    squared.mask_fill(zero.clone(), 1.0).sqrt().mask_fill(zero, 0.0)
}

/// Per-column dot product of two equally shaped tensors
pub fn column_dot<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    (a * b).sum_dim(0)
}

/// Trace of every `[d, d]` slice of a `[d, d, batch]` Jacobian tensor
pub fn batched_trace<B: Backend>(jacobian: Tensor<B, 3>) -> Tensor<B, 2> {
    let [d, _, batch] = jacobian.dims();
    // d == 1 falls out of the loop as the single entry
    let diagonal: Vec<Tensor<B, 2>> = (0..d)
        .map(|i| {
            jacobian
                .clone()
                .slice([i..i + 1, i..i + 1, 0..batch])
                .reshape([1, batch])
        })
        .collect();
    Tensor::cat(diagonal, 0).sum_dim(0)
}

/// One-hot cotangent with row `index` set to one for every column
///
/// Built from host data so it never carries autodiff history.
pub fn basis_cotangent<B: Backend>(rows: usize, batch: usize, index: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0; rows * batch];
    values[index * batch..(index + 1) * batch].fill(1.0);
    matrix(values, rows, batch, device)
}

/// Flatten a `[1, batch]` row into a `[batch]` vector
pub fn row_to_vector<B: Backend>(row: Tensor<B, 2>) -> Tensor<B, 1> {
    let [_, batch] = row.dims();
    row.reshape([batch])
}

/// Copy a tensor back to the host as f64 values
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|err| CnfError::Data(format!("{err:?}")))
}

/// Number of NaN or infinite entries
pub fn count_non_finite<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<usize> {
    Ok(to_host(tensor)?.iter().filter(|v| !v.is_finite()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AutodiffBackend, Backend as TestBackend, init_device};

    #[test]
    fn test_column_norms() {
        let device = init_device();
        // columns (3, 4) and (0, -2)
        let x = matrix::<TestBackend>(vec![3.0, 0.0, 4.0, -2.0], 2, 2, &device);

        let sq = to_host(column_squared_norm(x.clone())).unwrap();
        let norm = to_host(column_norm(x)).unwrap();

        assert_eq!(sq, vec![25.0, 4.0]);
        assert_eq!(norm, vec![5.0, 2.0]);
    }

    #[test]
    fn test_column_norm_gradient_at_zero_column() {
        let device = init_device();
        // columns (0, 0) and (3, 4)
        let x = matrix::<AutodiffBackend>(vec![0.0, 3.0, 0.0, 4.0], 2, 2, &device).require_grad();

        let norm = column_norm(x.clone());
        assert_eq!(to_host(norm.clone()).unwrap(), vec![0.0, 5.0]);

        let grads = norm.sum().backward();
        let grad = to_host(x.grad(&grads).expect("x requires grad")).unwrap();
        let expected = [0.0, 0.6, 0.0, 0.8];
        assert!(grad.iter().zip(expected).all(|(g, e)| (g - e).abs() < 1e-6), "{grad:?}");
    }

    #[test]
    fn test_batched_trace_sums_diagonals_per_column() {
        let device = init_device();
        // two 2x2 matrices stored as [d, d, batch]: diag(1, 2) and [[3, 9], [9, -1]]
        let values = vec![1.0, 3.0, 0.0, 9.0, 0.0, 9.0, 2.0, -1.0];
        let data = TensorData::new(values, [2, 2, 2]).convert::<f32>();
        let jac = Tensor::<TestBackend, 3>::from_data(data, &device);

        let trace = to_host(batched_trace(jac)).unwrap();
        assert_eq!(trace, vec![3.0, 2.0]);
    }

    #[test]
    fn test_batched_trace_scalar_case() {
        let device = init_device();
        let data = TensorData::new(vec![-0.25_f32, 4.0], [1, 1, 2]);
        let jac = Tensor::<TestBackend, 3>::from_data(data, &device);

        assert_eq!(to_host(batched_trace(jac)).unwrap(), vec![-0.25, 4.0]);
    }

    #[test]
    fn test_basis_cotangent_sets_one_row() {
        let device = init_device();
        let e = basis_cotangent::<TestBackend>(3, 2, 1, &device);

        assert_eq!(to_host(e).unwrap(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_count() {
        let device = init_device();
        let x = matrix::<TestBackend>(vec![1.0, f64::NAN, f64::INFINITY, 0.0], 1, 4, &device);

        assert_eq!(count_non_finite(x).unwrap(), 2);
    }
}
