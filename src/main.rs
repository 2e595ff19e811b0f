//! Riemannian Hamiltonian VAE (RHVAE) - Demo Application
//!
//! This binary demonstrates the basic functionality of the RHVAE implemented in Burn.
//! It initializes a model, runs a forward pass in both modes, updates the
//! learned metric from the training pass and draws a few samples from it.

#![recursion_limit = "256"]

use burn::backend::{
    Autodiff,
    wgpu::{Wgpu, WgpuDevice},
};
use burn::tensor::{Distribution, Tensor};
use rhvae::{ForwardMode, Rhvae, RhvaeConfig, RhvaeSampler, RhvaeSamplerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Backend = Autodiff<Wgpu>;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let device = WgpuDevice::default();

    let config = RhvaeConfig::new()
        .with_input_dim(Some(vec![1, 28, 28]))
        .with_latent_dim(2)
        .with_n_lf(3)
        .with_eps_lf(0.001)
        .with_beta_zero(0.3);

    info!("initializing model");
    let model: Rhvae<Backend> = config.init(&device)?;
    println!("{model}");

    let batch_size = 8;
    let input = Tensor::<Backend, 2>::random(
        [batch_size, 784],
        Distribution::Uniform(0.0, 1.0),
        &device,
    );

    let output = model.forward(input.clone(), ForwardMode::Train);
    info!(
        loss = ?output.loss.clone().into_scalar(),
        z = ?output.z.dims(),
        recon_x = ?output.recon_x.dims(),
        g_inv = ?output.g_inv.dims(),
        "training forward pass successful"
    );

    let model = model.update_metric(output.metric_sample.into_iter().collect());
    info!(centroids = model.metric.len(), "metric updated");

    let output = model.forward(input, ForwardMode::Eval);
    info!(loss = ?output.loss.into_scalar(), "evaluation forward pass successful");

    let sampler_config = RhvaeSamplerConfig::new().with_mcmc_steps(10);
    let mut sampler = RhvaeSampler::new(model, sampler_config)?.set_seed(8);
    let samples = sampler.sample(4, 4)?;
    info!(samples = ?samples.dims(), "generated samples");

    Ok(())
}
