//! Training pipeline: data checks, dataset construction and training.

use crate::dataset::RhvaeDataset;
use crate::error::{Result, RhvaeError};
use crate::model::Rhvae;
use crate::training::{Trainer, TrainingConfig};
use burn::tensor::{Tensor, backend::AutodiffBackend};
use std::path::PathBuf;
use tracing::info;

/// Train a model end to end from raw data.
pub struct TrainingPipeline<B: AutodiffBackend> {
    model: Rhvae<B>,
    training_config: TrainingConfig,
    device: B::Device,
    resume_dir: Option<PathBuf>,
    trainer: Option<Trainer<B>>,
}

impl<B: AutodiffBackend> TrainingPipeline<B> {
    pub fn new(model: Rhvae<B>, training_config: TrainingConfig, device: B::Device) -> Self {
        Self {
            model,
            training_config,
            device,
            resume_dir: None,
            trainer: None,
        }
    }

    /// Continue the training stored in `training_dir` from its latest checkpoint.
    pub fn resume_from(mut self, training_dir: impl Into<PathBuf>) -> Self {
        self.resume_dir = Some(training_dir.into());
        self
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training_config
    }

    /// Trainer of the last run.
    pub fn trainer(&self) -> Option<&Trainer<B>> {
        self.trainer.as_ref()
    }

    /// Train on `[n, D]` tensors. Returns the best model.
    pub fn run(&mut self, train_data: Tensor<B, 2>, eval_data: Option<Tensor<B, 2>>) -> Result<Rhvae<B>> {
        let train = RhvaeDataset::from_tensor(train_data)?;
        let eval = eval_data.map(RhvaeDataset::from_tensor).transpose()?;
        self.run_datasets(train, eval)
    }

    /// Train on prepared datasets. Returns the best model.
    pub fn run_datasets(
        &mut self,
        train_data: RhvaeDataset,
        eval_data: Option<RhvaeDataset>,
    ) -> Result<Rhvae<B>> {
        self.check_data("train", &train_data)?;
        if let Some(eval_data) = &eval_data {
            self.check_data("eval", eval_data)?;
        }

        info!(
            train = train_data.items.len(),
            eval = eval_data.as_ref().map_or(0, |data| data.items.len()),
            "data checked, building trainer"
        );

        let trainer = self.trainer.insert(Trainer::new(
            self.model.clone(),
            train_data,
            eval_data,
            self.training_config.clone(),
            self.device.clone(),
        )?);
        if let Some(dir) = &self.resume_dir {
            trainer.resume_from(dir)?;
        }
        trainer.train()
    }

    fn check_data(&self, name: &str, data: &RhvaeDataset) -> Result<()> {
        if data.items.is_empty() {
            return Err(RhvaeError::InvalidData(format!("{name} data is empty")));
        }
        if data.input_size() != self.model.input_size {
            return Err(RhvaeError::InvalidData(format!(
                "{name} data points hold {} values, the model expects {}",
                data.input_size(),
                self.model.input_size
            )));
        }
        Ok(())
    }
}
