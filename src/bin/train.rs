//! Training binary for the Riemannian Hamiltonian VAE (RHVAE)
//!
//! This binary reads data points from CSV files (one flattened data point per
//! line, values in `[0, 1]` for the `bce` loss) and trains an RHVAE with the
//! default networks, writing checkpoints and the final model under the output
//! directory.

#![recursion_limit = "256"]

use burn::backend::{Autodiff, Wgpu};
use clap::Parser;
use rhvae::{
    ReconstructionLoss, RhvaeConfig, RhvaeDataset, TrainingConfig, TrainingPipeline,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

type MyBackend = Wgpu<f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSV file with the training data points
    #[arg(long)]
    data: PathBuf,

    /// CSV file with the evaluation data points
    #[arg(long)]
    eval_data: Option<PathBuf>,

    /// Whether the CSV files start with a header line
    #[arg(long)]
    has_headers: bool,

    /// Shape of one data point, e.g. `1,28,28`
    #[arg(long, value_delimiter = ',', required = true)]
    input_dim: Vec<usize>,

    /// Latent space dimension
    #[arg(long, default_value = "10")]
    latent_dim: usize,

    /// Reconstruction loss, `mse` or `bce`
    #[arg(long, default_value = "mse")]
    reconstruction_loss: ReconstructionLoss,

    /// Number of leapfrog steps
    #[arg(long, default_value = "3")]
    n_lf: usize,

    /// Leapfrog step size
    #[arg(long, default_value = "0.001")]
    eps_lf: f64,

    /// Initial tempering factor
    #[arg(long, default_value = "0.3")]
    beta_zero: f64,

    /// Metric interpolation temperature
    #[arg(long, default_value = "1.5")]
    temperature: f64,

    /// Metric regularization
    #[arg(long, default_value = "0.01")]
    regularization: f64,

    /// Output directory for training artifacts
    #[arg(short, long, default_value = "/tmp/rhvae")]
    output_dir: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value = "100")]
    epochs: usize,

    /// Batch size
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Learning rate
    #[arg(long, default_value = "1e-4")]
    learning_rate: f64,

    /// Save a checkpoint every this many epochs
    #[arg(long)]
    steps_saving: Option<usize>,

    /// Resume the training stored in this directory from its latest checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value = "8")]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let model_config = RhvaeConfig::new()
        .with_input_dim(Some(args.input_dim.clone()))
        .with_latent_dim(args.latent_dim)
        .with_reconstruction_loss(args.reconstruction_loss)
        .with_n_lf(args.n_lf)
        .with_eps_lf(args.eps_lf)
        .with_beta_zero(args.beta_zero)
        .with_temperature(args.temperature)
        .with_regularization(args.regularization);
    let input_size: usize = args.input_dim.iter().product();

    let device = burn::backend::wgpu::WgpuDevice::default();
    info!(?device, output_dir = %args.output_dir.display(), "starting RHVAE training");

    // Load datasets
    let train_dataset = RhvaeDataset::from_csv(&args.data, input_size, args.has_headers)?;
    let eval_dataset = args
        .eval_data
        .as_ref()
        .map(|path| RhvaeDataset::from_csv(path, input_size, args.has_headers))
        .transpose()?;

    let training_config = TrainingConfig::new()
        .with_output_dir(args.output_dir.to_string_lossy().to_string())
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.learning_rate)
        .with_steps_saving(args.steps_saving)
        .with_seed(args.seed);

    // Create output directory
    std::fs::create_dir_all(&args.output_dir)?;

    let model = model_config.init::<MyAutodiffBackend>(&device)?;
    let mut pipeline = TrainingPipeline::new(model, training_config, device);
    if let Some(dir) = args.resume {
        pipeline = pipeline.resume_from(dir);
    }

    let model = pipeline.run_datasets(train_dataset, eval_dataset)?;

    let final_dir = pipeline
        .trainer()
        .and_then(|trainer| trainer.training_dir())
        .map(|dir| dir.join(rhvae::training::FINAL_MODEL_DIR));
    info!(
        centroids = model.metric.len(),
        final_model = ?final_dir,
        "training completed"
    );

    Ok(())
}
