//! Riemannian Hamiltonian VAE implementation in Burn
//!
//! The model is a VAE whose approximate posterior sample is refined by a few
//! steps of Hamiltonian dynamics on the latent space. The dynamics use a
//! position dependent metric `G(z)`:
//! - the metric network produces local factors `L(x)` during training
//! - the factors and encoder means are interpolated into `G_inv(z)`
//! - the momentum is sampled from `N(0, G(z))` and tempered along the trajectory
//!
//! Gradients of the Hamiltonian with respect to the latent position are taken
//! with reverse-mode autodiff on a detached copy of the decoder, so the forward
//! pass needs an autodiff backend.

use crate::config::{ReconstructionLoss, RhvaeConfig};
use crate::error::{Result, RhvaeError};
use crate::linalg;
use crate::metric::{MetricField, MetricSample, RiemannianMetric};
use crate::networks::{
    Decoder, Encoder, EncoderOutput, MetricNetwork, MetricNetworkConfig, MlpDecoderConfig,
    MlpEncoderConfig, NetworkConfig, NetworkRole,
};
use burn::module::{Content, DisplaySettings, Ignored, Module, ModuleDisplay};
use burn::tensor::{
    Distribution, Tensor,
    backend::{AutodiffBackend, Backend},
};
use std::f64::consts::PI;

/// Fixed-point iterations used by the implicit leapfrog sub-steps
const FIXED_POINT_ITERATIONS: usize = 3;

/// Custom networks injected in place of the default architectures.
#[derive(Debug, Clone, Default)]
pub struct CustomNetworks {
    pub encoder: Option<NetworkConfig>,
    pub decoder: Option<NetworkConfig>,
    pub metric: Option<NetworkConfig>,
}

impl CustomNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoder(mut self, network: impl Into<NetworkConfig>) -> Self {
        self.encoder = Some(network.into());
        self
    }

    pub fn with_decoder(mut self, network: impl Into<NetworkConfig>) -> Self {
        self.decoder = Some(network.into());
        self
    }

    pub fn with_metric(mut self, network: impl Into<NetworkConfig>) -> Self {
        self.metric = Some(network.into());
        self
    }

    /// Network injected in the slot of `role`.
    pub fn get(&self, role: NetworkRole) -> Option<&NetworkConfig> {
        match role {
            NetworkRole::Encoder => self.encoder.as_ref(),
            NetworkRole::Decoder => self.decoder.as_ref(),
            NetworkRole::Metric => self.metric.as_ref(),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NetworkRole, &NetworkConfig)> {
        [NetworkRole::Encoder, NetworkRole::Decoder, NetworkRole::Metric]
            .into_iter()
            .filter_map(|role| self.get(role).map(|network| (role, network)))
    }
}

/// Whether the forward pass uses the batch metric (training) or the learned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Train,
    Eval,
}

/// Outputs of a forward pass
#[derive(Debug, Clone)]
pub struct RhvaeOutput<B: Backend> {
    /// Negative ELBO averaged over the batch, shape `[1]`
    pub loss: Tensor<B, 1>,
    /// Reconstruction of the batch from the final latent position
    pub recon_x: Tensor<B, 2>,
    /// Final latent position `z_K`
    pub z: Tensor<B, 2>,
    /// Initial latent sample `z_0`
    pub z0: Tensor<B, 2>,
    /// Final momentum `rho_K`
    pub rho: Tensor<B, 2>,
    /// Noise used to draw `z_0`
    pub eps0: Tensor<B, 2>,
    /// Noise used to draw the initial momentum
    pub gamma: Tensor<B, 2>,
    pub mu: Tensor<B, 2>,
    pub log_var: Tensor<B, 2>,
    /// `G_inv(z_K)`
    pub g_inv: Tensor<B, 3>,
    /// `log det G(z_K)`
    pub g_log_det: Tensor<B, 1>,
    /// Local metric of the batch, only in training mode
    pub metric_sample: Option<MetricSample<B>>,
}

/// The Riemannian Hamiltonian VAE
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct Rhvae<B: Backend> {
    /// Encoder network
    pub encoder: Encoder<B>,
    /// Decoder network
    pub decoder: Decoder<B>,
    /// Network producing the local metric factors
    pub metric_network: MetricNetwork<B>,
    /// Learned metric (`M_tens`, `centroids_tens`)
    pub metric: RiemannianMetric<B>,
    /// Flattened size of a data point
    pub input_size: usize,
    config: Ignored<RhvaeConfig>,
    custom: Ignored<CustomNetworks>,
}

impl<B: Backend> ModuleDisplay for Rhvae<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(true)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("input_size", &self.input_size)
            .add("latent_dim", &self.config.latent_dim)
            .add("n_lf", &self.config.n_lf)
            .add("metric_centroids", &self.metric.len())
            .optional()
    }
}

impl RhvaeConfig {
    /// Initialize the model with the default architectures.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Rhvae<B>> {
        self.init_with(CustomNetworks::default(), device)
    }

    /// Initialize the model, replacing default architectures by `custom` ones.
    pub fn init_with<B: Backend>(
        &self,
        custom: CustomNetworks,
        device: &B::Device,
    ) -> Result<Rhvae<B>> {
        self.validate()?;
        let input_size = self.check_custom_networks(&custom)?;

        let mut config = self.clone();
        config.uses_default_encoder = custom.encoder.is_none();
        config.uses_default_decoder = custom.decoder.is_none();
        config.uses_default_metric = custom.metric.is_none();

        let encoder = match &custom.encoder {
            Some(network) => network
                .init_encoder(device)
                .ok_or_else(|| unsupported(NetworkRole::Encoder))?,
            None => Encoder::Mlp(
                MlpEncoderConfig::new(self.default_input_dim(NetworkRole::Encoder)?, self.latent_dim)
                    .init(device),
            ),
        };
        let decoder = match &custom.decoder {
            Some(network) => network
                .init_decoder(device)
                .ok_or_else(|| unsupported(NetworkRole::Decoder))?,
            None => Decoder::Mlp(
                MlpDecoderConfig::new(self.default_input_dim(NetworkRole::Decoder)?, self.latent_dim)
                    .init(device),
            ),
        };
        let metric_network = match &custom.metric {
            Some(network) => network
                .init_metric(device)
                .ok_or_else(|| unsupported(NetworkRole::Metric))?,
            None => MetricNetworkConfig::new(
                self.default_input_dim(NetworkRole::Metric)?,
                self.latent_dim,
            )
            .init(device),
        };

        let input_size = input_size
            .or(self.input_size())
            .ok_or(RhvaeError::MissingInputDim {
                slot: NetworkRole::Encoder,
            })?;

        Ok(Rhvae {
            encoder,
            decoder,
            metric_network,
            metric: RiemannianMetric::new(
                self.latent_dim,
                self.temperature,
                self.regularization,
                device,
            ),
            input_size,
            config: Ignored(config),
            custom: Ignored(custom),
        })
    }

    fn default_input_dim(&self, slot: NetworkRole) -> Result<Vec<usize>> {
        self.input_dim
            .clone()
            .ok_or(RhvaeError::MissingInputDim { slot })
    }

    /// Check every injected network against its slot and the model dimensions.
    ///
    /// Returns the data size the custom networks agree on, if any.
    fn check_custom_networks(&self, custom: &CustomNetworks) -> Result<Option<usize>> {
        for (slot, network) in custom.iter() {
            if network.role() != slot {
                return Err(RhvaeError::BadInheritance {
                    slot,
                    found: network.role(),
                });
            }
        }

        let mut expected = self.input_size();
        for (role, network) in custom.iter() {
            if network.latent_dim() != self.latent_dim {
                return Err(RhvaeError::LatentDimMismatch {
                    role,
                    expected: self.latent_dim,
                    found: network.latent_dim(),
                });
            }
            if !network.supports_input() {
                return Err(unsupported(role));
            }
            let size: usize = network.input_dim().iter().product();
            match expected {
                Some(expected) if expected != size => {
                    return Err(RhvaeError::InputDimMismatch {
                        role,
                        expected,
                        found: size,
                    });
                }
                Some(_) => {}
                None => expected = Some(size),
            }
        }
        Ok(expected)
    }
}

fn unsupported(role: NetworkRole) -> RhvaeError {
    RhvaeError::InvalidConfig(format!("the custom {role} does not support its input shape"))
}

/// Square root of the tempering factor after `k` of `n_lf` leapfrog steps.
///
/// Grows quadratically from `sqrt(beta_zero)` at `k = 0` to 1 at `k = n_lf`.
pub(crate) fn tempering(k: usize, n_lf: usize, beta_zero_sqrt: f64) -> f64 {
    let inv_beta_zero_sqrt = 1.0 / beta_zero_sqrt;
    let progress = k as f64 / n_lf as f64;
    1.0 / ((1.0 - inv_beta_zero_sqrt) * progress * progress + inv_beta_zero_sqrt)
}

/// `log N(v; 0, I)` for each row, shape `[n]`.
fn log_standard_normal<B: Backend>(v: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, d] = v.dims();
    (v.powf_scalar(2.0).sum_dim(1) * -0.5).reshape([n]) - (d as f64) * (2.0 * PI).ln() / 2.0
}

impl<B: Backend> Rhvae<B> {
    pub fn model_config(&self) -> &RhvaeConfig {
        &self.config
    }

    pub fn custom_networks(&self) -> &CustomNetworks {
        &self.custom
    }

    pub fn latent_dim(&self) -> usize {
        self.config.latent_dim
    }

    pub fn n_lf(&self) -> usize {
        self.config.n_lf
    }

    pub fn eps_lf(&self) -> f64 {
        self.config.eps_lf
    }

    pub fn temperature(&self) -> f64 {
        self.config.temperature
    }

    pub fn regularization(&self) -> f64 {
        self.config.regularization
    }

    pub fn beta_zero_sqrt(&self) -> f64 {
        self.config.beta_zero.sqrt()
    }

    pub fn encode(&self, x: Tensor<B, 2>) -> EncoderOutput<B> {
        self.encoder.forward(x)
    }

    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.decoder.forward(z)
    }

    /// Decode the posterior means.
    pub fn reconstruct(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.decode(self.encode(x).embedding)
    }

    /// Learned metric `G(z)`, shape `[n, d, d]`.
    pub fn g(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        self.metric.g(z)
    }

    /// Learned inverse metric `G_inv(z)`, shape `[n, d, d]`.
    pub fn g_inv(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        self.metric.g_inv(z)
    }

    /// Replace the learned metric by the samples collected over an epoch.
    pub fn update_metric(mut self, samples: Vec<MetricSample<B>>) -> Self {
        self.metric = self.metric.update(samples);
        self
    }

    /// `log p(x|z)` for each row, shape `[n]`.
    fn log_p_x_given_z(&self, recon_x: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = x.dims();
        let log_p = match self.config.reconstruction_loss {
            ReconstructionLoss::Mse => (recon_x - x).powf_scalar(2.0).sum_dim(1) * -0.5,
            ReconstructionLoss::Bce => {
                let p = recon_x.clamp(1e-7, 1.0 - 1e-7);
                (x.clone() * p.clone().log() + (x.neg() + 1.0) * (p.neg() + 1.0).log()).sum_dim(1)
            }
        };
        log_p.reshape([n])
    }

    /// `H(z, rho)` for each row, shape `[n]`.
    fn hamiltonian(
        &self,
        decoder: &Decoder<B>,
        x: Tensor<B, 2>,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        field: &MetricField<B>,
    ) -> Tensor<B, 1> {
        let recon_x = decoder.forward(z.clone());
        let g_inv = field.g_inv(z.clone());
        let g_log_det = linalg::log_det(g_inv.clone()).neg();
        let log_pxz = self.log_p_x_given_z(recon_x, x) + log_standard_normal(z);

        log_pxz.neg() + linalg::quadratic_form(g_inv, rho) * 0.5 + g_log_det * 0.5
    }

    fn tempering(&self, k: usize) -> f64 {
        tempering(k, self.n_lf(), self.beta_zero_sqrt())
    }

    #[allow(clippy::too_many_arguments)]
    fn loss_function(
        &self,
        recon_x: Tensor<B, 2>,
        x: Tensor<B, 2>,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        eps0: Tensor<B, 2>,
        log_var: Tensor<B, 2>,
        g_inv: Tensor<B, 3>,
        g_log_det: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let [n, d] = z.dims();
        let log_norm = (d as f64) * (2.0 * PI).ln() / 2.0;

        // log p(x, z_K)
        let log_pxz = self.log_p_x_given_z(recon_x, x) + log_standard_normal(z);
        // log p(rho_K) with rho_K ~ N(0, G(z_K))
        let log_rho = linalg::quadratic_form(g_inv, rho) * -0.5 - g_log_det * 0.5 - log_norm;
        // log q(z_0|x)
        let log_q = log_standard_normal(eps0) - log_var.sum_dim(1).reshape([n]) * 0.5;

        (log_pxz + log_rho - log_q).mean().neg()
    }
}

impl<B: AutodiffBackend> Rhvae<B> {
    /// Forward pass through the encoder, the leapfrog integrator and the decoder.
    ///
    /// The `dH/dz` terms of the leapfrog steps are computed on detached inputs
    /// and enter the loss as constants, since burn has no higher-order
    /// autodiff. Gradients of the returned loss are therefore approximate: the
    /// networks are reached through `z_0`, `rho_0`, the explicit `G_inv`
    /// terms and the final reconstruction, not through the integrator's
    /// gradient evaluations.
    pub fn forward(&self, x: Tensor<B, 2>, mode: ForwardMode) -> RhvaeOutput<B> {
        let [n, _] = x.dims();
        let d = self.latent_dim();
        let device = x.device();

        let EncoderOutput {
            embedding: mu,
            log_covariance: log_var,
        } = self.encoder.forward(x.clone());
        let std = (log_var.clone() * 0.5).exp();
        let eps0 = Tensor::random([n, d], Distribution::Normal(0.0, 1.0), &device);
        let z0 = mu.clone() + eps0.clone() * std;

        // Metric field and factor used to draw the initial momentum
        let (field, factor, metric_sample) = match mode {
            ForwardMode::Train => {
                let l = self.metric_network.forward(x.clone());
                let matrices = l.clone().matmul(l.clone().swap_dims(1, 2));
                let sample = MetricSample {
                    matrices: matrices.clone().detach(),
                    centroids: mu.clone().detach(),
                };
                let field = MetricField {
                    matrices,
                    centroids: mu.clone(),
                    temperature: self.temperature(),
                    regularization: self.regularization(),
                };
                (field, l, Some(sample))
            }
            ForwardMode::Eval => {
                let field = self.metric.field();
                let l = linalg::cholesky(field.g(z0.clone()));
                (field, l, None)
            }
        };

        let mut z = z0.clone();
        let mut g_inv = field.g_inv(z.clone());
        let mut g_log_det = linalg::log_det(g_inv.clone()).neg();

        let gamma = Tensor::random([n, d], Distribution::Normal(0.0, 1.0), &device);
        let beta_zero_sqrt = self.beta_zero_sqrt();
        let mut rho = linalg::matvec(factor, gamma.clone() / beta_zero_sqrt);
        let mut beta_sqrt_old = beta_zero_sqrt;

        for k in 1..=self.n_lf() {
            let rho_half = self.leap_step_1(&x, z.clone(), rho, &field);
            z = self.leap_step_2(z, rho_half.clone(), g_inv, &field);

            g_inv = field.g_inv(z.clone());
            g_log_det = linalg::log_det(g_inv.clone()).neg();

            let rho_full = self.leap_step_3(&x, z.clone(), rho_half, &field);

            let beta_sqrt = self.tempering(k);
            rho = rho_full * (beta_sqrt_old / beta_sqrt);
            beta_sqrt_old = beta_sqrt;
        }

        let recon_x = self.decoder.forward(z.clone());
        let loss = self.loss_function(
            recon_x.clone(),
            x,
            z.clone(),
            rho.clone(),
            eps0.clone(),
            log_var.clone(),
            g_inv.clone(),
            g_log_det.clone(),
        );

        RhvaeOutput {
            loss,
            recon_x,
            z,
            z0,
            rho,
            eps0,
            gamma,
            mu,
            log_var,
            g_inv,
            g_log_det,
            metric_sample,
        }
    }

    /// `dH/dz` at `(z, rho)`, treated as a constant by the outer graph.
    fn hamiltonian_grad_z(
        &self,
        x: &Tensor<B, 2>,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        field: &MetricField<B>,
    ) -> Tensor<B, 2> {
        let decoder = self.decoder.clone().no_grad();
        let field = field.detach();
        let z = z.detach().require_grad();

        let hamiltonian = self.hamiltonian(
            &decoder,
            x.clone().detach(),
            z.clone(),
            rho.detach(),
            &field,
        );
        let grads = hamiltonian.sum().backward();

        match z.grad(&grads) {
            Some(grad) => Tensor::from_inner(grad),
            None => Tensor::zeros(z.dims(), &z.device()),
        }
    }

    /// Half step on the momentum, implicit in `rho`.
    fn leap_step_1(
        &self,
        x: &Tensor<B, 2>,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        field: &MetricField<B>,
    ) -> Tensor<B, 2> {
        let half_eps = self.eps_lf() / 2.0;
        let mut rho_ = rho.clone();
        for _ in 0..FIXED_POINT_ITERATIONS {
            let grad = self.hamiltonian_grad_z(x, z.clone(), rho_, field);
            rho_ = rho.clone() - grad * half_eps;
        }
        rho_
    }

    /// Full step on the position, implicit in `z`. `dH/drho = G_inv(z) rho`.
    fn leap_step_2(
        &self,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        g_inv: Tensor<B, 3>,
        field: &MetricField<B>,
    ) -> Tensor<B, 2> {
        let half_eps = self.eps_lf() / 2.0;
        let velocity_start = linalg::matvec(g_inv, rho.clone());
        let mut z_ = z.clone();
        for _ in 0..FIXED_POINT_ITERATIONS {
            let velocity_end = linalg::matvec(field.g_inv(z_), rho.clone());
            z_ = z.clone() + (velocity_start.clone() + velocity_end) * half_eps;
        }
        z_
    }

    /// Explicit half step on the momentum.
    fn leap_step_3(
        &self,
        x: &Tensor<B, 2>,
        z: Tensor<B, 2>,
        rho: Tensor<B, 2>,
        field: &MetricField<B>,
    ) -> Tensor<B, 2> {
        let grad = self.hamiltonian_grad_z(x, z, rho.clone(), field);
        rho - grad * (self.eps_lf() / 2.0)
    }
}
