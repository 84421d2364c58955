use burn::module::Param;
use burn::prelude::*;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Distribution;
use std::marker::PhantomData;

use crate::error::{CnfError, Result as CnfResult};

/// Vector-Jacobian product operator returned alongside a dynamics evaluation
///
/// `apply(e)` computes `Jᵀ e` where `J = ∂v/∂z` at the point the pullback was
/// created for. Cotangents and results are `[d, batch]`.
pub struct Pullback<'a, B: Backend> {
    op: Box<dyn Fn(Tensor<B, 2>) -> Tensor<B, 2> + 'a>,
}

impl<'a, B: Backend> Pullback<'a, B> {
    pub fn new(op: impl Fn(Tensor<B, 2>) -> Tensor<B, 2> + 'a) -> Self {
        Self { op: Box::new(op) }
    }

    pub fn apply(&self, cotangent: Tensor<B, 2>) -> Tensor<B, 2> {
        (self.op)(cotangent)
    }
}

/// Autonomous dynamics `v = f(z, θ)` of a continuous normalizing flow
///
/// States are `[d, batch]` with one column per batch element. The parameters
/// `θ` live inside the implementing module and are never mutated here.
pub trait DynamicsFunction<B: Backend> {
    /// State dimensionality `d`, when the implementation fixes one
    fn input_dim(&self) -> Option<usize>;

    /// Velocity at `z`, same shape as `z`
    fn velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Velocity at `z` together with its reverse-mode pullback
    fn vjp<'a>(&'a self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Pullback<'a, B>);

    /// Single-vector calling convention: `[d] -> [d]`
    fn velocity_vector(&self, z: Tensor<B, 1>) -> Tensor<B, 1> {
        let [d] = z.dims();
        self.velocity(z.reshape([d, 1])).reshape([d])
    }
}

/// A velocity model that only knows how to run forward
///
/// Wrapped in [`AutodiffDynamics`] it gets its pullback from Burn's autodiff.
pub trait VelocityField<B: Backend> {
    fn forward_velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2>;

    fn state_dim(&self) -> Option<usize> {
        None
    }
}

/// Affine dynamics `v = A z + b`
///
/// The Jacobian is the constant matrix `A`, which makes this the reference
/// model for checking trace computations.
#[derive(Module, Debug)]
pub struct LinearDynamics<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 2>>,
}

impl<B: Backend> LinearDynamics<B> {
    /// `weight` must be square `[d, d]`; `bias` is `[d]` or zero when absent
    pub fn new(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> CnfResult<Self> {
        let [rows, cols] = weight.dims();
        if rows != cols {
            return Err(CnfError::shape("linear dynamics weight", &[cols, cols], &[rows, cols]));
        }
        let bias = match bias {
            Some(bias) => {
                if bias.dims() != [rows] {
                    return Err(CnfError::shape("linear dynamics bias", &[rows], &bias.dims()));
                }
                bias.reshape([rows, 1])
            }
            None => Tensor::zeros([rows, 1], &weight.device()),
        };

        Ok(Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
        })
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }
}

impl<B: Backend> DynamicsFunction<B> for LinearDynamics<B> {
    fn input_dim(&self) -> Option<usize> {
        Some(self.weight.dims()[0])
    }

    fn velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.weight.val().matmul(z) + self.bias.val()
    }

    fn vjp<'a>(&'a self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Pullback<'a, B>) {
        let v = self.velocity(z);
        let weight_t = self.weight.val().transpose();
        (v, Pullback::new(move |e| weight_t.clone().matmul(e)))
    }
}

impl<B: Backend> VelocityField<B> for LinearDynamics<B> {
    fn forward_velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.velocity(z)
    }

    fn state_dim(&self) -> Option<usize> {
        self.input_dim()
    }
}

/// Configuration for [`MlpDynamics`]
#[derive(Config, Debug)]
pub struct MlpDynamicsConfig {
    /// State dimensionality (input and output width)
    pub dim: usize,
    /// Hidden layer widths, all followed by `tanh`
    #[config(default = "Vec::new()")]
    pub hidden: Vec<usize>,
    /// Apply `tanh` after the output layer too
    #[config(default = true)]
    pub tanh_output: bool,
    /// Weight std is `init_scale / sqrt(fan_in)`
    #[config(default = 1.0)]
    pub init_scale: f64,
}

impl MlpDynamicsConfig {
    /// Returns the initialized dynamics with random weights and zero biases
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpDynamics<B> {
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(self.dim);
        widths.extend(self.hidden.iter().copied());
        widths.push(self.dim);

        let layers = widths
            .windows(2)
            .map(|w| {
                let (fan_in, fan_out) = (w[0], w[1]);
                let std = self.init_scale / (fan_in as f64).sqrt();
                DenseLayer {
                    weight: Param::from_tensor(Tensor::random(
                        [fan_out, fan_in],
                        Distribution::Normal(0.0, std),
                        device,
                    )),
                    bias: Param::from_tensor(Tensor::zeros([fan_out, 1], device)),
                }
            })
            .collect();

        MlpDynamics {
            layers,
            tanh_output: self.tanh_output,
        }
    }
}

/// One affine layer acting on `[in, batch]` columns
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 2>>,
}

impl<B: Backend> DenseLayer<B> {
    fn forward(&self, a: Tensor<B, 2>) -> Tensor<B, 2> {
        self.weight.val().matmul(a) + self.bias.val()
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }
}

/// Multi-layer perceptron dynamics with `tanh` activations
///
/// The pullback is written out layer by layer using ordinary tensor ops, so on
/// an autodiff backend the trace terms stay differentiable in the weights.
#[derive(Module, Debug)]
pub struct MlpDynamics<B: Backend> {
    layers: Vec<DenseLayer<B>>,
    tanh_output: bool,
}

impl<B: Backend> MlpDynamics<B> {
    /// Build from explicit `(weight [out, in], bias [out])` pairs
    pub fn from_layers(layers: Vec<(Tensor<B, 2>, Tensor<B, 1>)>, tanh_output: bool) -> CnfResult<Self> {
        let (first, last) = match (layers.first(), layers.last()) {
            (Some(first), Some(last)) => (first.0.dims(), last.0.dims()),
            _ => return Err(CnfError::InvalidConfig("MLP dynamics needs at least one layer".into())),
        };
        if first[1] != last[0] {
            return Err(CnfError::shape("MLP dynamics output width", &[first[1]], &[last[0]]));
        }

        let mut dense = Vec::with_capacity(layers.len());
        let mut width = first[1];
        for (weight, bias) in layers {
            let [out, input] = weight.dims();
            if input != width {
                return Err(CnfError::shape("MLP layer input width", &[width], &[input]));
            }
            if bias.dims() != [out] {
                return Err(CnfError::shape("MLP layer bias", &[out], &bias.dims()));
            }
            dense.push(DenseLayer {
                weight: Param::from_tensor(weight),
                bias: Param::from_tensor(bias.reshape([out, 1])),
            });
            width = out;
        }

        Ok(Self {
            layers: dense,
            tanh_output,
        })
    }

    pub fn layers(&self) -> &[DenseLayer<B>] {
        &self.layers
    }

    fn activated(&self, index: usize) -> bool {
        index + 1 < self.layers.len() || self.tanh_output
    }
}

impl<B: Backend> DynamicsFunction<B> for MlpDynamics<B> {
    fn input_dim(&self) -> Option<usize> {
        self.layers.first().map(|layer| layer.weight.dims()[1])
    }

    fn velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.layers.iter().enumerate().fold(z, |a, (i, layer)| {
            let h = layer.forward(a);
            if self.activated(i) { h.tanh() } else { h }
        })
    }

    fn vjp<'a>(&'a self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Pullback<'a, B>) {
        // tanh'(h) = 1 - tanh(h)^2, kept per layer for the reverse sweep
        let mut slopes: Vec<Option<Tensor<B, 2>>> = Vec::with_capacity(self.layers.len());
        let mut a = z;
        for (i, layer) in self.layers.iter().enumerate() {
            let h = layer.forward(a);
            if self.activated(i) {
                let out = h.tanh();
                slopes.push(Some(out.clone().powf_scalar(2.0).neg().add_scalar(1.0)));
                a = out;
            } else {
                slopes.push(None);
                a = h;
            }
        }

        let pullback = Pullback::new(move |e: Tensor<B, 2>| {
            self.layers
                .iter()
                .zip(slopes.iter())
                .rev()
                .fold(e, |g, (layer, slope)| {
                    let g = match slope {
                        Some(slope) => g * slope.clone(),
                        None => g,
                    };
                    layer.weight.val().transpose().matmul(g)
                })
        });

        (a, pullback)
    }
}

impl<B: Backend> VelocityField<B> for MlpDynamics<B> {
    fn forward_velocity(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.velocity(z)
    }

    fn state_dim(&self) -> Option<usize> {
        self.input_dim()
    }
}

/// Dynamics whose pullback comes from Burn's reverse-mode autodiff
///
/// The model runs on the autodiff backend `A`; states and results live on its
/// inner backend. Each pullback application re-runs the forward pass on a
/// fresh tracked copy of `z`, so gradients never leak into the caller's graph.
/// Parameter gradients of the trace are not available through this wrapper;
/// use a dynamics type with an explicit pullback for training.
pub struct AutodiffDynamics<A: AutodiffBackend, M: VelocityField<A>> {
    model: M,
    _backend: PhantomData<A>,
}

impl<A: AutodiffBackend, M: VelocityField<A>> AutodiffDynamics<A, M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            _backend: PhantomData,
        }
    }
}

impl<A: AutodiffBackend, M: VelocityField<A>> DynamicsFunction<A::InnerBackend> for AutodiffDynamics<A, M> {
    fn input_dim(&self) -> Option<usize> {
        self.model.state_dim()
    }

    fn velocity(&self, z: Tensor<A::InnerBackend, 2>) -> Tensor<A::InnerBackend, 2> {
        self.model.forward_velocity(Tensor::from_inner(z)).inner()
    }

    fn vjp<'a>(&'a self, z: Tensor<A::InnerBackend, 2>) -> (Tensor<A::InnerBackend, 2>, Pullback<'a, A::InnerBackend>) {
        let v = self.velocity(z.clone());
        let pullback = Pullback::new(move |e: Tensor<A::InnerBackend, 2>| {
            let tracked = Tensor::<A, 2>::from_inner(z.clone()).require_grad();
            let out = self.model.forward_velocity(tracked.clone());
            let grads = (out * Tensor::from_inner(e.clone())).sum().backward();
            tracked.grad(&grads).unwrap_or_else(|| e.zeros_like())
        });
        (v, pullback)
    }
}
