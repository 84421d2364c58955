//! Centralized device and backend selection for the CNF layers
//!
//! The layers are generic over any Burn backend. This module fixes the
//! defaults used by the binary and the tests: the `NdArray` CPU backend,
//! wrapped in `Autodiff` when gradients are needed.

use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
use std::sync::OnceLock;

/// Global device instance shared by the binary and the tests
static DEVICE: OnceLock<NdArrayDevice> = OnceLock::new();

/// Initialize the default CPU device once and hand out clones of it
///
/// # Example
/// ```rust
/// use cnf_rust::device::init_device;
///
/// let device = init_device();
/// ```
pub fn init_device() -> NdArrayDevice {
    DEVICE
        .get_or_init(|| {
            let device = NdArrayDevice::default();
            log::debug!("initialized ndarray device: {:?}", device);
            device
        })
        .clone()
}

/// Type alias for the backend used for density evaluation
pub type Backend = NdArray<f32>;

/// Type alias for the autodiff backend used when parameters are trained
pub type AutodiffBackend = Autodiff<Backend>;

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;

    #[test]
    fn test_device_initialization() {
        let device = init_device();

        let test_tensor = Tensor::<Backend, 1>::from_floats([1.0, 2.0, 3.0], &device);
        assert_eq!(test_tensor.dims(), [3]);

        let result = test_tensor.clone() + test_tensor;
        assert_eq!(result.dims(), [3]);
    }

    #[test]
    fn test_autodiff_backend_tracks_gradients() {
        let device = init_device();

        let x = Tensor::<AutodiffBackend, 1>::from_floats([1.0, -2.0], &device).require_grad();
        let grads = (x.clone() * x.clone()).sum().backward();
        let grad = x.grad(&grads).expect("x requires grad");

        let values = grad.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![2.0, -4.0]);
    }
}
