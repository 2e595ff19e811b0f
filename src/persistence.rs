//! Saving and loading a model directory.
//!
//! A model directory holds:
//! - `model_config.json`: the [`RhvaeConfig`]
//! - `model.mpk`: every parameter, including the learned metric
//! - `encoder.json`, `decoder.json`, `metric.json`: descriptors of the custom
//!   networks, written only for the slots that do not use the default network

use crate::config::RhvaeConfig;
use crate::error::{Result, RhvaeError};
use crate::metric::RiemannianMetric;
use crate::model::{CustomNetworks, Rhvae};
use crate::networks::{NetworkConfig, NetworkRole};
use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::{Tensor, backend::Backend};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MODEL_CONFIG_FILE: &str = "model_config.json";
pub const MODEL_WEIGHTS_FILE: &str = "model.mpk";

/// File recorder used for model weights and optimizer state.
pub type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Path of the descriptor of the custom network filling `role`.
pub fn network_artifact(dir: &Path, role: NetworkRole) -> PathBuf {
    dir.join(format!("{}.json", role.artifact_stem()))
}

fn require(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(RhvaeError::MissingArtifact { path })
    }
}

fn uses_default(config: &RhvaeConfig, role: NetworkRole) -> bool {
    match role {
        NetworkRole::Encoder => config.uses_default_encoder,
        NetworkRole::Decoder => config.uses_default_decoder,
        NetworkRole::Metric => config.uses_default_metric,
    }
}

fn read_network(dir: &Path, role: NetworkRole) -> Result<NetworkConfig> {
    let path = require(network_artifact(dir, role))?;
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

impl<B: Backend> Rhvae<B> {
    /// Write the model into `dir`, creating it if needed.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        self.model_config().save(dir.join(MODEL_CONFIG_FILE))?;

        for (role, network) in self.custom_networks().iter() {
            let writer = BufWriter::new(File::create(network_artifact(dir, role))?);
            serde_json::to_writer_pretty(writer, network)?;
        }

        // The recorder appends its own extension
        ModelRecorder::new().record(self.clone().into_record(), dir.join("model"))?;

        debug!(dir = %dir.display(), centroids = self.metric.len(), "model saved");
        Ok(())
    }

    /// Rebuild a model saved with [`Rhvae::save`].
    pub fn load_from_folder(dir: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let dir = dir.as_ref();

        let config_path = require(dir.join(MODEL_CONFIG_FILE))?;
        let config = RhvaeConfig::load(&config_path)
            .map_err(|err| RhvaeError::InvalidConfig(format!("{err:?}")))?;
        require(dir.join(MODEL_WEIGHTS_FILE))?;

        let mut custom = CustomNetworks::new();
        for role in [NetworkRole::Encoder, NetworkRole::Decoder, NetworkRole::Metric] {
            if uses_default(&config, role) {
                continue;
            }
            let network = read_network(dir, role)?;
            match role {
                NetworkRole::Encoder => custom.encoder = Some(network),
                NetworkRole::Decoder => custom.decoder = Some(network),
                NetworkRole::Metric => custom.metric = Some(network),
            }
        }

        let record: <Self as Module<B>>::Record = ModelRecorder::new().load(dir.join("model"), device)?;

        // The stored metric grows with training, size the skeleton after the record
        let [k, d, _] = record.metric.m_tens.val().dims();
        let mut model = config.init_with::<B>(custom, device)?;
        model.metric = RiemannianMetric::from_tensors(
            Tensor::zeros([k, d, d], device),
            Tensor::zeros([k, d], device),
            config.temperature,
            config.regularization,
        );

        debug!(dir = %dir.display(), centroids = k, "model loaded");
        Ok(model.load_record(record))
    }
}
