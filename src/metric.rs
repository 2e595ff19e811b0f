//! Riemannian metric over the latent space.
//!
//! The inverse metric is a smooth interpolation of stored positive matrices
//! `M_k = L_k L_k^T` located at centroids `c_k`:
//!
//! `G_inv(z) = sum_k M_k exp(-||z - c_k||^2 / T^2) + lambda I`
//!
//! During training the matrices and centroids come from the current batch; at
//! the end of every epoch the batches seen are concatenated into the stored
//! [`RiemannianMetric`], which then defines `G` and `G_inv` for evaluation and
//! sampling.

use crate::linalg;
use burn::module::{Module, Param};
use burn::tensor::{Tensor, backend::Backend};

/// Batch of local metric factors collected during a training forward pass.
#[derive(Debug, Clone)]
pub struct MetricSample<B: Backend> {
    /// `L L^T`, shape `[n, d, d]`
    pub matrices: Tensor<B, 3>,
    /// Encoder means, shape `[n, d]`
    pub centroids: Tensor<B, 2>,
}

/// Metric field defined by a set of matrices and centroids.
#[derive(Debug, Clone)]
pub struct MetricField<B: Backend> {
    pub matrices: Tensor<B, 3>,
    pub centroids: Tensor<B, 2>,
    pub temperature: f64,
    pub regularization: f64,
}

impl<B: Backend> MetricField<B> {
    /// Copy of the field cut from the autodiff graph.
    pub fn detach(&self) -> Self {
        Self {
            matrices: self.matrices.clone().detach(),
            centroids: self.centroids.clone().detach(),
            temperature: self.temperature,
            regularization: self.regularization,
        }
    }

    /// Interpolation weights `exp(-||z_i - c_k||^2 / T^2)`, shape `[n, K]`.
    fn weights(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, _] = z.dims();
        let [k, _] = self.centroids.dims();
        let z_sq = z.clone().powf_scalar(2.0).sum_dim(1).repeat_dim(1, k);
        let c_sq = self
            .centroids
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .transpose()
            .repeat_dim(0, n);
        let cross = z.matmul(self.centroids.clone().transpose());
        let sq_dist = (z_sq + c_sq - cross * 2.0).clamp_min(0.0);
        (sq_dist / -(self.temperature * self.temperature)).exp()
    }

    /// Inverse metric `G_inv(z)`, shape `[n, d, d]`.
    pub fn g_inv(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        let [n, d] = z.dims();
        let [k, _, _] = self.matrices.dims();
        let device = z.device();

        let weighted = self
            .weights(z)
            .matmul(self.matrices.clone().reshape([k, d * d]))
            .reshape([n, d, d]);
        let identity = linalg::eye::<B>(d, &device)
            .unsqueeze_dim::<3>(0)
            .repeat_dim(0, n);
        weighted + identity * self.regularization
    }

    /// Metric `G(z)`, shape `[n, d, d]`.
    pub fn g(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        linalg::inverse(self.g_inv(z))
    }
}

/// Learned metric stored alongside the model parameters.
///
/// The tensors are parameters only so that they are recorded with the model;
/// they never require gradients and are replaced wholesale by [`update`].
///
/// [`update`]: RiemannianMetric::update
#[derive(Module, Debug)]
pub struct RiemannianMetric<B: Backend> {
    /// Stored matrices `M_tens`, shape `[K, d, d]`
    pub m_tens: Param<Tensor<B, 3>>,
    /// Stored centroids `centroids_tens`, shape `[K, d]`
    pub centroids_tens: Param<Tensor<B, 2>>,
    pub temperature: f64,
    pub regularization: f64,
}

impl<B: Backend> RiemannianMetric<B> {
    /// Starting metric: a single identity matrix at the origin.
    pub fn new(latent_dim: usize, temperature: f64, regularization: f64, device: &B::Device) -> Self {
        let m_tens = linalg::eye::<B>(latent_dim, device).unsqueeze_dim::<3>(0);
        let centroids = Tensor::zeros([1, latent_dim], device);
        Self::from_tensors(m_tens, centroids, temperature, regularization)
    }

    pub fn from_tensors(
        m_tens: Tensor<B, 3>,
        centroids: Tensor<B, 2>,
        temperature: f64,
        regularization: f64,
    ) -> Self {
        Self {
            m_tens: Param::from_tensor(m_tens).set_require_grad(false),
            centroids_tens: Param::from_tensor(centroids).set_require_grad(false),
            temperature,
            regularization,
        }
    }

    /// Number of stored centroids.
    pub fn len(&self) -> usize {
        self.centroids_tens.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field(&self) -> MetricField<B> {
        MetricField {
            matrices: self.m_tens.val().detach(),
            centroids: self.centroids_tens.val().detach(),
            temperature: self.temperature,
            regularization: self.regularization,
        }
    }

    pub fn g(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        self.field().g(z)
    }

    pub fn g_inv(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        self.field().g_inv(z)
    }

    /// Replace the stored metric by the concatenation of `samples`.
    ///
    /// Returns the metric unchanged when no sample was collected.
    pub fn update(self, samples: Vec<MetricSample<B>>) -> Self {
        if samples.is_empty() {
            return self;
        }
        let (matrices, centroids): (Vec<_>, Vec<_>) = samples
            .into_iter()
            .map(|s| (s.matrices.detach(), s.centroids.detach()))
            .unzip();

        Self {
            m_tens: Param::initialized(self.m_tens.id, Tensor::cat(matrices, 0))
                .set_require_grad(false),
            centroids_tens: Param::initialized(self.centroids_tens.id, Tensor::cat(centroids, 0))
                .set_require_grad(false),
            temperature: self.temperature,
            regularization: self.regularization,
        }
    }
}
