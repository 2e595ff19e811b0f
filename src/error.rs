//! Error types for model construction, persistence and training.

use crate::networks::NetworkRole;
use burn::record::RecorderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RhvaeError {
    /// A network descriptor was injected into a slot of a different role.
    #[error("the {slot} slot requires an {slot} architecture, got a {found} architecture")]
    BadInheritance {
        slot: NetworkRole,
        found: NetworkRole,
    },

    /// The default network of `slot` needs `input_dim`, which the config lacks.
    #[error("no `input_dim` in the model configuration to build the default {slot}")]
    MissingInputDim { slot: NetworkRole },

    #[error("custom {role} works on latent dimension {found}, model expects {expected}")]
    LatentDimMismatch {
        role: NetworkRole,
        expected: usize,
        found: usize,
    },

    #[error("custom {role} works on inputs of size {found}, model expects {expected}")]
    InputDimMismatch {
        role: NetworkRole,
        expected: usize,
        found: usize,
    },

    #[error("missing model artifact {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("NaN detected in the training loss at epoch {epoch}")]
    NanLoss { epoch: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("record error: {0:?}")]
    Record(RecorderError),
}

impl From<RecorderError> for RhvaeError {
    fn from(err: RecorderError) -> Self {
        Self::Record(err)
    }
}

pub type Result<T> = std::result::Result<T, RhvaeError>;
