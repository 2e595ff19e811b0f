//! Model configuration for the Riemannian Hamiltonian VAE.

use crate::error::{self, RhvaeError};
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Likelihood used for `log p(x|z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconstructionLoss {
    /// Gaussian likelihood with identity covariance.
    Mse,
    /// Bernoulli likelihood, data must lie in `[0, 1]`.
    Bce,
}

impl fmt::Display for ReconstructionLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mse => write!(f, "mse"),
            Self::Bce => write!(f, "bce"),
        }
    }
}

impl std::str::FromStr for ReconstructionLoss {
    type Err = RhvaeError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mse" => Ok(Self::Mse),
            "bce" => Ok(Self::Bce),
            other => Err(RhvaeError::InvalidConfig(format!(
                "unknown reconstruction loss `{other}`, expected `mse` or `bce`"
            ))),
        }
    }
}

/// Configuration for the RHVAE model
#[derive(Config, Debug)]
pub struct RhvaeConfig {
    /// Shape of a single data point, e.g. `[1, 28, 28]`
    #[config(default = "None")]
    pub input_dim: Option<Vec<usize>>,
    /// Latent space dimension
    #[config(default = 10)]
    pub latent_dim: usize,
    /// Reconstruction likelihood
    #[config(default = "ReconstructionLoss::Mse")]
    pub reconstruction_loss: ReconstructionLoss,
    /// Number of leapfrog steps per forward pass
    #[config(default = 3)]
    pub n_lf: usize,
    /// Leapfrog step size
    #[config(default = 0.001)]
    pub eps_lf: f64,
    /// Initial tempering factor, in (0, 1]
    #[config(default = 0.3)]
    pub beta_zero: f64,
    /// Temperature of the metric interpolation
    #[config(default = 1.5)]
    pub temperature: f64,
    /// Regularization added to the inverse metric
    #[config(default = 0.01)]
    pub regularization: f64,
    #[config(default = true)]
    pub uses_default_encoder: bool,
    #[config(default = true)]
    pub uses_default_decoder: bool,
    #[config(default = true)]
    pub uses_default_metric: bool,
}

impl RhvaeConfig {
    /// Flattened size of one data point, if `input_dim` is known.
    pub fn input_size(&self) -> Option<usize> {
        self.input_dim.as_ref().map(|dims| dims.iter().product())
    }

    /// Check hyperparameter ranges.
    pub fn validate(&self) -> error::Result<()> {
        if self.latent_dim == 0 {
            return Err(RhvaeError::InvalidConfig(
                "latent_dim must be positive".to_string(),
            ));
        }
        if !(self.beta_zero > 0.0 && self.beta_zero <= 1.0) {
            return Err(RhvaeError::InvalidConfig(format!(
                "beta_zero must be in (0, 1], got {}",
                self.beta_zero
            )));
        }
        if self.eps_lf <= 0.0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "eps_lf must be positive, got {}",
                self.eps_lf
            )));
        }
        if self.temperature <= 0.0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.regularization <= 0.0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "regularization must be positive, got {}",
                self.regularization
            )));
        }
        if let Some(dims) = &self.input_dim {
            if dims.is_empty() || dims.contains(&0) {
                return Err(RhvaeError::InvalidConfig(format!(
                    "input_dim must be non-empty with positive sizes, got {dims:?}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RhvaeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RhvaeConfig::new();

        assert_eq!(config.input_dim, None);
        assert_eq!(config.latent_dim, 10);
        assert_eq!(config.reconstruction_loss, ReconstructionLoss::Mse);
        assert_eq!(config.n_lf, 3);
        assert_eq!(config.eps_lf, 0.001);
        assert_eq!(config.beta_zero, 0.3);
        assert_eq!(config.temperature, 1.5);
        assert_eq!(config.regularization, 0.01);
        assert!(config.uses_default_encoder);
        assert!(config.uses_default_decoder);
        assert!(config.uses_default_metric);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_input_size() {
        let config = RhvaeConfig::new().with_input_dim(Some(vec![1, 28, 28]));
        assert_eq!(config.input_size(), Some(784));
        assert_eq!(RhvaeConfig::new().input_size(), None);
    }

    #[test]
    fn test_rejects_bad_beta_zero() {
        for beta_zero in [0.0, -0.5, 1.5] {
            let config = RhvaeConfig::new().with_beta_zero(beta_zero);
            assert!(matches!(
                config.validate(),
                Err(RhvaeError::InvalidConfig(_))
            ));
        }
        assert!(RhvaeConfig::new().with_beta_zero(1.0).validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_regularization() {
        for regularization in [0.0, -0.01] {
            let config = RhvaeConfig::new()
                .with_input_dim(Some(vec![4]))
                .with_regularization(regularization);
            assert!(matches!(
                config.validate(),
                Err(RhvaeError::InvalidConfig(_))
            ));
        }
        assert!(RhvaeConfig::new().with_regularization(1e-6).validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_input_dim() {
        let config = RhvaeConfig::new().with_input_dim(Some(vec![1, 0, 3]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconstruction_loss_parsing() {
        assert_eq!(
            "BCE".parse::<ReconstructionLoss>().unwrap(),
            ReconstructionLoss::Bce
        );
        assert_eq!(ReconstructionLoss::Mse.to_string(), "mse");
        assert!("l1".parse::<ReconstructionLoss>().is_err());
    }

    #[test]
    fn test_json_keeps_loss_name() {
        let config = RhvaeConfig::new().with_reconstruction_loss(ReconstructionLoss::Bce);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"bce\""));

        let parsed: RhvaeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reconstruction_loss, ReconstructionLoss::Bce);
    }
}
