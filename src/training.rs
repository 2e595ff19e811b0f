//! Training loop for the RHVAE
//!
//! The trainer owns the model, an Adam optimizer and the data loaders. Every
//! epoch runs a training pass (one optimizer step per batch, then a metric
//! update from the batch metrics seen during the epoch) and an optional
//! evaluation pass. Outputs land in a timestamped training directory:
//!
//! ```text
//! <output_dir>/RHVAE_training_<YYYY-MM-DD_hh-mm-ss-mmm>/
//!     checkpoint_epoch_<n>/   model files, optimizer.mpk, training_config.json
//!     final_model/            model files, training_config.json
//! ```

use crate::dataset::{RhvaeBatch, RhvaeBatcher, RhvaeDataset};
use crate::error::{self, RhvaeError};
use crate::model::{ForwardMode, Rhvae};
use crate::persistence::ModelRecorder;
use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::Module,
    optim::{Adam, AdamConfig, GradientsParams, Optimizer, adaptor::OptimizerAdaptor},
    record::Recorder,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TRAINING_CONFIG_FILE: &str = "training_config.json";
pub const OPTIMIZER_FILE: &str = "optimizer.mpk";
pub const FINAL_MODEL_DIR: &str = "final_model";
const CHECKPOINT_PREFIX: &str = "checkpoint_epoch_";

/// Configuration for RHVAE training
#[derive(Config)]
pub struct TrainingConfig {
    /// Directory receiving the training directories
    #[config(default = "String::from(\"dummy_output_dir\")")]
    pub output_dir: String,
    /// Optimizer configuration
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    /// Number of training epochs
    #[config(default = 100)]
    pub num_epochs: usize,
    /// Batch size
    #[config(default = 100)]
    pub batch_size: usize,
    /// Learning rate
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Save a checkpoint every `steps_saving` epochs
    #[config(default = "None")]
    pub steps_saving: Option<usize>,
    /// Random seed for reproducibility
    #[config(default = 8)]
    pub seed: u64,
    /// Number of data loader workers
    #[config(default = 1)]
    pub num_workers: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.batch_size == 0 {
            return Err(RhvaeError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(RhvaeError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.steps_saving == Some(0) {
            return Err(RhvaeError::InvalidConfig(
                "steps_saving must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Name of a training directory, e.g. `RHVAE_training_2024-01-31_12-00-00-042`.
pub fn training_signature() -> String {
    format!(
        "RHVAE_training_{}",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S-%3f")
    )
}

/// Check if checkpoints exist and return the latest checkpoint epoch and directory
pub fn find_latest_checkpoint(training_dir: impl AsRef<Path>) -> Option<(usize, PathBuf)> {
    let entries = std::fs::read_dir(training_dir.as_ref()).ok()?;

    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(epoch) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|epoch| epoch.parse::<usize>().ok())
        else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| epoch > *best) {
            latest = Some((epoch, entry.path()));
        }
    }
    latest
}

type Loader<B> = Arc<dyn DataLoader<B, RhvaeBatch<B>>>;

/// Trainer for the RHVAE with checkpointing and resumption.
pub struct Trainer<B: AutodiffBackend> {
    model: Rhvae<B>,
    best_model: Rhvae<B>,
    best_loss: f64,
    optimizer: OptimizerAdaptor<Adam, Rhvae<B>, B>,
    config: TrainingConfig,
    train_loader: Loader<B>,
    eval_loader: Option<Loader<B>>,
    device: B::Device,
    training_dir: Option<PathBuf>,
    start_epoch: usize,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        model: Rhvae<B>,
        train_dataset: RhvaeDataset,
        eval_dataset: Option<RhvaeDataset>,
        config: TrainingConfig,
        device: B::Device,
    ) -> error::Result<Self> {
        config.validate()?;

        // Set random seed
        B::seed(config.seed);

        let train_loader = DataLoaderBuilder::new(RhvaeBatcher::<B>::new())
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(config.num_workers)
            .build(train_dataset);

        let eval_loader = eval_dataset.map(|dataset| {
            DataLoaderBuilder::new(RhvaeBatcher::<B>::new())
                .batch_size(config.batch_size)
                .num_workers(config.num_workers)
                .build(dataset)
        });

        let model = model.fork(&device);

        Ok(Self {
            best_model: model.clone(),
            best_loss: f64::INFINITY,
            optimizer: config.optimizer.init(),
            model,
            config,
            train_loader,
            eval_loader,
            device,
            training_dir: None,
            start_epoch: 0,
        })
    }

    pub fn model(&self) -> &Rhvae<B> {
        &self.model
    }

    /// Optimizer holding the Adam state of every trained parameter.
    pub fn optimizer(&self) -> &OptimizerAdaptor<Adam, Rhvae<B>, B> {
        &self.optimizer
    }

    /// Model with the lowest epoch loss so far.
    pub fn best_model(&self) -> &Rhvae<B> {
        &self.best_model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Directory of the current training, once [`Trainer::train`] started.
    pub fn training_dir(&self) -> Option<&Path> {
        self.training_dir.as_deref()
    }

    /// One pass over the training data. Returns the mean batch loss.
    pub fn train_step(&mut self, epoch: usize) -> error::Result<f64> {
        let mut epoch_loss = 0.0;
        let mut num_batches = 0usize;
        let mut metric_samples = Vec::new();

        for batch in self.train_loader.iter() {
            let output = self.model.forward(batch.data, ForwardMode::Train);
            let loss = output.loss.clone().into_scalar().elem::<f64>();
            if loss.is_nan() {
                return Err(RhvaeError::NanLoss { epoch });
            }

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self
                .optimizer
                .step(self.config.learning_rate, self.model.clone(), grads);

            if let Some(sample) = output.metric_sample {
                metric_samples.push(sample);
            }
            epoch_loss += loss;
            num_batches += 1;
        }

        self.model = self.model.clone().update_metric(metric_samples);
        debug!(epoch, centroids = self.model.metric.len(), "metric updated");

        Ok(epoch_loss / num_batches.max(1) as f64)
    }

    /// Mean loss over the evaluation data, `None` without evaluation data.
    pub fn eval_step(&self, epoch: usize) -> error::Result<Option<f64>> {
        let Some(loader) = &self.eval_loader else {
            return Ok(None);
        };

        let mut epoch_loss = 0.0;
        let mut num_batches = 0usize;
        for batch in loader.iter() {
            let output = self.model.forward(batch.data, ForwardMode::Eval);
            let loss = output.loss.into_scalar().elem::<f64>();
            if loss.is_nan() {
                return Err(RhvaeError::NanLoss { epoch });
            }
            epoch_loss += loss;
            num_batches += 1;
        }

        Ok(Some(epoch_loss / num_batches.max(1) as f64))
    }

    /// Write `model`, the optimizer state and the training config into `dir`.
    pub fn save_checkpoint(&self, model: &Rhvae<B>, dir: impl AsRef<Path>, epoch: usize) -> error::Result<()> {
        let dir = dir.as_ref();
        model.save(dir)?;
        ModelRecorder::new().record(self.optimizer.to_record(), dir.join("optimizer"))?;
        self.config.save(dir.join(TRAINING_CONFIG_FILE))?;
        info!(epoch, dir = %dir.display(), "checkpoint saved");
        Ok(())
    }

    /// Resume from the latest checkpoint of an existing training directory.
    ///
    /// Returns the epoch of the checkpoint, or `None` when the directory holds
    /// no checkpoint, in which case training will start fresh inside it.
    pub fn resume_from(&mut self, training_dir: impl AsRef<Path>) -> error::Result<Option<usize>> {
        let training_dir = training_dir.as_ref().to_path_buf();
        let latest = find_latest_checkpoint(&training_dir);
        self.training_dir = Some(training_dir);

        let Some((epoch, checkpoint)) = latest else {
            info!("no existing checkpoint found, starting fresh training");
            return Ok(None);
        };

        let model = Rhvae::<B>::load_from_folder(&checkpoint, &self.device)?;
        if model.input_size != self.model.input_size || model.latent_dim() != self.model.latent_dim() {
            return Err(RhvaeError::InvalidConfig(format!(
                "checkpoint {} does not match the model being trained",
                checkpoint.display()
            )));
        }

        let record = ModelRecorder::new().load(checkpoint.join("optimizer"), &self.device)?;
        self.optimizer = self.optimizer.clone().load_record(record);
        self.best_model = model.clone();
        self.model = model;
        self.start_epoch = epoch;

        info!(epoch, dir = %checkpoint.display(), "found existing checkpoint, resuming training");
        Ok(Some(epoch))
    }

    fn prepare_training_dir(&mut self) -> error::Result<PathBuf> {
        if let Some(dir) = &self.training_dir {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        let output_dir = Path::new(&self.config.output_dir);
        std::fs::create_dir_all(output_dir)?;
        // Another run may have taken the same signature
        loop {
            let dir = output_dir.join(training_signature());
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    self.training_dir = Some(dir.clone());
                    return Ok(dir);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Run the whole training and return the best model.
    pub fn train(&mut self) -> error::Result<Rhvae<B>> {
        let training_dir = self.prepare_training_dir()?;
        info!(
            dir = %training_dir.display(),
            epochs = self.config.num_epochs,
            start_epoch = self.start_epoch,
            batch_size = self.config.batch_size,
            learning_rate = self.config.learning_rate,
            "starting training"
        );

        for epoch in self.start_epoch + 1..=self.config.num_epochs {
            let train_loss = self.train_step(epoch)?;
            let eval_loss = self.eval_step(epoch)?;

            let epoch_loss = eval_loss.unwrap_or(train_loss);
            if epoch_loss < self.best_loss {
                self.best_loss = epoch_loss;
                self.best_model = self.model.clone();
                debug!(epoch, loss = epoch_loss, "new best model");
            } else if epoch_loss.is_infinite() {
                warn!(epoch, "infinite epoch loss");
            }

            if let Some(steps) = self.config.steps_saving {
                if epoch % steps == 0 {
                    let dir = training_dir.join(format!("{CHECKPOINT_PREFIX}{epoch}"));
                    self.save_checkpoint(&self.best_model, dir, epoch)?;
                }
            }

            match eval_loss {
                Some(eval_loss) => info!(epoch, train_loss, eval_loss, "epoch finished"),
                None => info!(epoch, train_loss, "epoch finished"),
            }
        }

        let final_dir = training_dir.join(FINAL_MODEL_DIR);
        self.best_model.save(&final_dir)?;
        self.config.save(final_dir.join(TRAINING_CONFIG_FILE))?;

        info!(dir = %final_dir.display(), "training completed, final model saved");
        Ok(self.best_model.clone())
    }
}
