//! Riemannian Hamiltonian VAE (RHVAE) Library
//!
//! This library provides an implementation of the RHVAE in the Burn framework.
//! The model learns a Riemannian metric over its latent space and refines its
//! posterior samples with tempered Hamiltonian dynamics guided by that metric.
//! It includes custom sub-networks, model persistence, a training loop with
//! checkpoints and a sampler generating data from the learned geometry.

pub mod config;
pub mod dataset;
pub mod error;
pub mod linalg;
pub mod metric;
pub mod model;
pub mod networks;
pub mod persistence;
pub mod pipeline;
pub mod sampler;
pub mod training;

// Re-export main types for convenience
pub use config::{ReconstructionLoss, RhvaeConfig};
pub use dataset::{RhvaeBatch, RhvaeBatcher, RhvaeDataset, RhvaeItem};
pub use error::{Result, RhvaeError};
pub use metric::{MetricField, MetricSample, RiemannianMetric};
pub use model::{CustomNetworks, ForwardMode, Rhvae, RhvaeOutput};
pub use networks::{
    ConvDecoderConfig, ConvEncoderConfig, MetricNetworkConfig, MlpDecoderConfig,
    MlpEncoderConfig, NetworkConfig, NetworkRole,
};
pub use pipeline::TrainingPipeline;
pub use sampler::{RhvaeSampler, RhvaeSamplerConfig};
pub use training::{Trainer, TrainingConfig, find_latest_checkpoint};
