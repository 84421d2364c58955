use burn::tensor::Tensor;
use cnf_rust::{
    CnfConfig, MlpDynamics, ProbeKind,
    device::{Backend, init_device},
    linalg::{matrix, to_host},
};
use rand::{SeedableRng, rngs::StdRng};

fn main() -> cnf_rust::Result<()> {
    let device = init_device();
    println!("NdArray device selected: {:?}", device);

    // v = tanh(w z + b) on ℝ¹
    let weight = matrix::<Backend>(vec![0.8], 1, 1, &device);
    let bias = Tensor::<Backend, 1>::from_floats([-0.1], &device);
    let dynamics = MlpDynamics::from_layers(vec![(weight, bias)], true)?;

    let config = CnfConfig::new().with_regularize(true);
    let ffjord = config.init_ffjord(dynamics)?;

    let mut rng = StdRng::seed_from_u64(42);
    let probe = ProbeKind::Rademacher.sample::<Backend, _>(&mut rng, [1, 1], &device);
    let x = matrix::<Backend>(vec![0.5], 1, 1, &device);

    let first = ffjord.forward(x.clone(), Some(probe.clone()))?;
    let second = ffjord.forward(x, Some(probe))?;

    println!("log p(x)    = {:?}", to_host(first.log_density.clone())?);
    println!("z(t1)       = {:?}", to_host(first.transformed)?);
    println!("Δlogp       = {:?}", to_host(first.delta_logp)?);
    println!("λ₁, λ₂      = {:?}, {:?}", to_host(first.lambda1)?, to_host(first.lambda2)?);
    println!("solver      = {:?}", first.stats);

    let repeat_identical = to_host(first.log_density)? == to_host(second.log_density)?;
    println!("Repeated call bit-identical: {}", repeat_identical);

    let samples = ffjord.generate(5, &mut rng, &device)?;
    println!("Generated samples: {:?}", to_host(samples)?);

    Ok(())
}
