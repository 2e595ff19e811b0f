//! Generation from a trained RHVAE.
//!
//! Latent points are drawn by Hamiltonian Monte Carlo on the density
//! `pi(z) ∝ sqrt(det G_inv(z))`, which is high where the learned metric is
//! small, i.e. close to the training data in the latent space. Chains start at
//! stored metric centroids, run a tempered leapfrog trajectory per step and
//! go through a Metropolis accept/reject test. Accepted latents are decoded.

use crate::error::{self, RhvaeError};
use crate::linalg;
use crate::metric::MetricField;
use crate::model::{Rhvae, tempering};
use burn::config::Config;
use burn::tensor::{Distribution, Int, Tensor, TensorData, backend::AutodiffBackend};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

/// `log pi(z)` is clamped to this value
const MAX_LOG_PI: f64 = 23.025850929940457; // ln(1e10)

/// Configuration for the RHVAE sampler
#[derive(Config, Debug)]
pub struct RhvaeSamplerConfig {
    /// Accept/reject steps per chain
    #[config(default = 100)]
    pub mcmc_steps: usize,
    /// Leapfrog steps per trajectory
    #[config(default = 15)]
    pub n_lf: usize,
    /// Leapfrog step size
    #[config(default = 0.03)]
    pub eps_lf: f64,
    /// Initial tempering factor, in (0, 1]
    #[config(default = 1.0)]
    pub beta_zero: f64,
}

impl RhvaeSamplerConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.n_lf == 0 {
            return Err(RhvaeError::InvalidConfig(
                "sampler n_lf must be positive".to_string(),
            ));
        }
        if self.eps_lf <= 0.0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "sampler eps_lf must be positive, got {}",
                self.eps_lf
            )));
        }
        if !(self.beta_zero > 0.0 && self.beta_zero <= 1.0) {
            return Err(RhvaeError::InvalidConfig(format!(
                "sampler beta_zero must be in (0, 1], got {}",
                self.beta_zero
            )));
        }
        Ok(())
    }
}

/// HMC sampler on the learned latent geometry.
pub struct RhvaeSampler<B: AutodiffBackend> {
    model: Rhvae<B>,
    config: RhvaeSamplerConfig,
    rng: StdRng,
}

impl<B: AutodiffBackend> RhvaeSampler<B> {
    pub fn new(model: Rhvae<B>, config: RhvaeSamplerConfig) -> error::Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    /// Set the random seed used to pick starting centroids and accept moves.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &RhvaeSamplerConfig {
        &self.config
    }

    /// Generate `num_samples` data points, `[num_samples, D]`, running
    /// `batch_size` chains at a time.
    pub fn sample(&mut self, num_samples: usize, batch_size: usize) -> error::Result<Tensor<B, 2>> {
        if num_samples == 0 || batch_size == 0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "cannot sample {num_samples} points by batches of {batch_size}"
            )));
        }

        let mut generated = Vec::with_capacity(num_samples.div_ceil(batch_size));
        let mut remaining = num_samples;
        while remaining > 0 {
            let n = remaining.min(batch_size);
            let z = self.hmc_sampling(n);
            generated.push(self.model.decode(z).detach());
            remaining -= n;
        }

        Ok(Tensor::cat(generated, 0))
    }

    /// Latent samples from `n` independent chains, `[n, d]`.
    pub fn hmc_sampling(&mut self, n: usize) -> Tensor<B, 2> {
        let field = self.model.metric.field();
        let [k, d] = field.centroids.dims();
        let device = field.centroids.device();

        let beta_zero_sqrt = self.config.beta_zero.sqrt();
        let eps = self.config.eps_lf;

        // Chains start at randomly chosen centroids
        let starts: Vec<i64> = (0..n).map(|_| self.rng.random_range(0..k) as i64).collect();
        let starts = Tensor::<B, 1, Int>::from_data(TensorData::new(starts, [n]), &device);
        let mut z0 = field.centroids.clone().select(0, starts);
        let mut z = z0.clone();

        for step in 0..self.config.mcmc_steps {
            let gamma = Tensor::random([n, d], Distribution::Normal(0.0, 1.0), &device);
            let mut rho = gamma / beta_zero_sqrt;
            let h0 = hamiltonian(&field, z0.clone(), rho.clone());

            let mut beta_sqrt_old = beta_zero_sqrt;
            for lf in 1..=self.config.n_lf {
                let rho_half = rho + grad_log_pi(&field, z.clone()) * (eps / 2.0);
                z = z + rho_half.clone() * eps;
                let rho_full = rho_half + grad_log_pi(&field, z.clone()) * (eps / 2.0);

                let beta_sqrt = tempering(lf, self.config.n_lf, beta_zero_sqrt);
                rho = rho_full * (beta_sqrt_old / beta_sqrt);
                beta_sqrt_old = beta_sqrt;
            }

            let h = hamiltonian(&field, z.clone(), rho);
            let alpha = (h0 - h).exp();

            let uniforms: Vec<f32> = (0..n).map(|_| self.rng.random::<f32>()).collect();
            let uniforms = Tensor::<B, 1>::from_data(TensorData::new(uniforms, [n]), &device);
            let moves = uniforms.lower(alpha).float();

            let moves = moves.reshape([n, 1]).repeat_dim(1, d);
            z = z * moves.clone() + z0 * (moves.clone().neg() + 1.0);
            z0 = z.clone();

            if step % 10 == 0 {
                let acceptance = moves.mean().into_scalar();
                debug!(step, acceptance = ?acceptance, "hmc step");
            }
        }

        z
    }
}

/// `log pi(z) = 1/2 log det G_inv(z)`, shape `[n]`.
fn log_pi<B: AutodiffBackend>(field: &MetricField<B>, z: Tensor<B, 2>) -> Tensor<B, 1> {
    (linalg::log_det(field.g_inv(z)) * 0.5).clamp_max(MAX_LOG_PI)
}

fn grad_log_pi<B: AutodiffBackend>(field: &MetricField<B>, z: Tensor<B, 2>) -> Tensor<B, 2> {
    let z = z.detach().require_grad();
    let grads = log_pi(field, z.clone()).sum().backward();
    match z.grad(&grads) {
        Some(grad) => Tensor::from_inner(grad),
        None => Tensor::zeros(z.dims(), &z.device()),
    }
}

fn hamiltonian<B: AutodiffBackend>(field: &MetricField<B>, z: Tensor<B, 2>, rho: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = rho.dims();
    log_pi(field, z).neg() + rho.powf_scalar(2.0).sum_dim(1).reshape([n]) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RhvaeConfig;
    use crate::metric::MetricSample;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn model() -> Rhvae<TestBackend> {
        let device = Default::default();
        let model = RhvaeConfig::new()
            .with_input_dim(Some(vec![1, 3, 3]))
            .with_latent_dim(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let l = Tensor::random([4, 2, 2], Distribution::Uniform(0.1, 1.0), &device);
        let sample = MetricSample {
            matrices: l.clone().matmul(l.swap_dims(1, 2)),
            centroids: Tensor::random([4, 2], Distribution::Normal(0.0, 1.0), &device),
        };
        model.update_metric(vec![sample])
    }

    #[test]
    fn test_sampler_config_defaults() {
        let config = RhvaeSamplerConfig::new();
        assert_eq!(config.mcmc_steps, 100);
        assert_eq!(config.n_lf, 15);
        assert_eq!(config.eps_lf, 0.03);
        assert_eq!(config.beta_zero, 1.0);
        assert!(config.validate().is_ok());
        assert!(config.with_beta_zero(0.0).validate().is_err());
    }

    #[test]
    fn test_sample_shape() {
        let config = RhvaeSamplerConfig::new().with_mcmc_steps(3).with_n_lf(2);
        let mut sampler = RhvaeSampler::new(model(), config).unwrap().set_seed(0);

        let samples = sampler.sample(7, 3).unwrap();
        assert_eq!(samples.dims(), [7, 9]);

        let values = samples.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite() && *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_chains_start_at_centroids() {
        let model = model();
        let centroids = model
            .metric
            .centroids_tens
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let config = RhvaeSamplerConfig::new().with_mcmc_steps(0);
        let mut sampler = RhvaeSampler::new(model, config).unwrap().set_seed(3);

        let z = sampler.hmc_sampling(5).into_data().to_vec::<f32>().unwrap();
        for chain in z.chunks(2) {
            assert!(centroids.chunks(2).any(|c| c == chain));
        }
    }

    #[test]
    fn test_rejects_empty_request() {
        let mut sampler = RhvaeSampler::new(model(), RhvaeSamplerConfig::new()).unwrap();
        assert!(sampler.sample(0, 10).is_err());
        assert!(sampler.sample(10, 0).is_err());
    }
}
