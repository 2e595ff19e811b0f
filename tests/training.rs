use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::{Module, ParamId};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::{Distribution, Tensor};
use rhvae::training::{FINAL_MODEL_DIR, OPTIMIZER_FILE, TRAINING_CONFIG_FILE};
use rhvae::{
    ConvDecoderConfig, ConvEncoderConfig, CustomNetworks, MetricNetworkConfig, Rhvae,
    RhvaeConfig, RhvaeDataset, Trainer, TrainingConfig, TrainingPipeline,
    find_latest_checkpoint,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;

type TestBackend = Autodiff<NdArray>;

const INPUT_DIM: [usize; 3] = [1, 4, 4];

fn model_config() -> RhvaeConfig {
    RhvaeConfig::new()
        .with_input_dim(Some(INPUT_DIM.to_vec()))
        .with_latent_dim(2)
        .with_n_lf(2)
        .with_eps_lf(0.01)
}

fn custom_variants() -> Vec<CustomNetworks> {
    let input_dim = INPUT_DIM.to_vec();
    vec![
        CustomNetworks::new(),
        CustomNetworks::new()
            .with_encoder(ConvEncoderConfig::new(input_dim.clone(), 2).with_channels(vec![3])),
        CustomNetworks::new()
            .with_decoder(ConvDecoderConfig::new(input_dim.clone(), 2).with_channels(vec![3]))
            .with_metric(MetricNetworkConfig::new(input_dim, 2).with_hidden_dims(vec![8, 8])),
    ]
}

fn dataset(n: usize) -> RhvaeDataset {
    let rows = (0..n)
        .map(|i| (0..16).map(|j| ((i + 3 * j) % 7) as f32 / 7.0).collect())
        .collect();
    RhvaeDataset::new(rows, 16).unwrap()
}

fn training_config(output_dir: &Path) -> TrainingConfig {
    TrainingConfig::new()
        .with_output_dir(output_dir.display().to_string())
        .with_num_epochs(3)
        .with_batch_size(5)
        .with_learning_rate(1e-3)
        .with_steps_saving(Some(2))
}

fn record_bytes(model: &Rhvae<TestBackend>) -> Vec<u8> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .unwrap()
}

fn optimizer_state(trainer: &Trainer<TestBackend>) -> HashMap<ParamId, Vec<u8>> {
    trainer
        .optimizer()
        .to_record()
        .into_iter()
        .map(|(id, record)| {
            let bytes = BinBytesRecorder::<FullPrecisionSettings>::default()
                .record(record, ())
                .unwrap();
            (id, bytes)
        })
        .collect()
}

fn file_names(dir: &Path) -> HashSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect()
}

fn check_custom_artifacts(dir: &Path, config: &RhvaeConfig) {
    let files = file_names(dir);
    assert_eq!(files.contains("encoder.json"), !config.uses_default_encoder);
    assert_eq!(files.contains("decoder.json"), !config.uses_default_decoder);
    assert_eq!(files.contains("metric.json"), !config.uses_default_metric);
}

fn check_same_model(reloaded: &Rhvae<TestBackend>, model: &Rhvae<TestBackend>) {
    assert_eq!(record_bytes(reloaded), record_bytes(model));
    reloaded
        .metric
        .m_tens
        .val()
        .into_data()
        .assert_eq(&model.metric.m_tens.val().into_data(), true);
    reloaded
        .metric
        .centroids_tens
        .val()
        .into_data()
        .assert_eq(&model.metric.centroids_tens.val().into_data(), true);
    assert_eq!(
        std::mem::discriminant(&reloaded.encoder),
        std::mem::discriminant(&model.encoder)
    );
    assert_eq!(
        std::mem::discriminant(&reloaded.decoder),
        std::mem::discriminant(&model.decoder)
    );
}

#[test]
fn test_checkpoint_saving() {
    let device = Default::default();
    for custom in custom_variants() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_config()
            .init_with::<TestBackend>(custom.clone(), &device)
            .unwrap();
        let mut trainer = Trainer::new(
            model,
            dataset(12),
            None,
            training_config(dir.path()),
            device,
        )
        .unwrap();
        trainer.train_step(1).unwrap();

        // Checkpoints can be written without a running training
        let checkpoint_dir = dir.path().join("checkpoint_epoch_9");
        let current = trainer.model().clone();
        trainer.save_checkpoint(&current, &checkpoint_dir, 9).unwrap();

        let files = file_names(&checkpoint_dir);
        for expected in ["model.mpk", "model_config.json", OPTIMIZER_FILE, TRAINING_CONFIG_FILE] {
            assert!(files.contains(expected), "{expected} missing");
        }
        check_custom_artifacts(&checkpoint_dir, current.model_config());

        let reloaded = Rhvae::<TestBackend>::load_from_folder(&checkpoint_dir, &device).unwrap();
        check_same_model(&reloaded, &current);

        // The reloaded training config matches
        let config = TrainingConfig::load(checkpoint_dir.join(TRAINING_CONFIG_FILE)).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.steps_saving, Some(2));

        // The optimizer state reloads parameter by parameter
        let mut resumed = Trainer::new(
            model_config().init_with::<TestBackend>(custom, &device).unwrap(),
            dataset(12),
            None,
            training_config(dir.path()),
            device,
        )
        .unwrap();
        assert_eq!(resumed.resume_from(dir.path()).unwrap(), Some(9));
        check_same_model(resumed.model(), &current);
        let state = optimizer_state(&trainer);
        assert!(!state.is_empty());
        assert_eq!(optimizer_state(&resumed), state);

        trainer.train_step(2).unwrap();
        assert_ne!(record_bytes(trainer.model()), record_bytes(&reloaded));
    }
}

#[test]
fn test_full_training_layout() {
    let device = Default::default();
    for custom in custom_variants() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_config()
            .init_with::<TestBackend>(custom, &device)
            .unwrap();
        let mut trainer = Trainer::new(
            model,
            dataset(12),
            Some(dataset(6)),
            training_config(dir.path()),
            device,
        )
        .unwrap();

        let best = trainer.train().unwrap();

        let training_dir = trainer.training_dir().unwrap().to_path_buf();
        assert_eq!(training_dir.parent().unwrap(), dir.path());
        let name = training_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("RHVAE_training_"));

        let files = file_names(&training_dir);
        assert!(files.contains("checkpoint_epoch_2"));
        assert!(!files.contains("checkpoint_epoch_1"));
        assert!(!files.contains("checkpoint_epoch_3"));
        assert!(files.contains(FINAL_MODEL_DIR));

        let final_dir = training_dir.join(FINAL_MODEL_DIR);
        let final_files = file_names(&final_dir);
        for expected in ["model.mpk", "model_config.json", TRAINING_CONFIG_FILE] {
            assert!(final_files.contains(expected), "{expected} missing");
        }
        check_custom_artifacts(&final_dir, best.model_config());

        // After training the metric holds one centroid per training point
        assert_eq!(best.metric.len(), 12);

        let reloaded = Rhvae::<TestBackend>::load_from_folder(&final_dir, &device).unwrap();
        check_same_model(&reloaded, &best);
        check_same_model(&reloaded, trainer.best_model());
    }
}

#[test]
fn test_resume_from_checkpoint() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();

    let mut trainer = Trainer::new(
        model_config().init::<TestBackend>(&device).unwrap(),
        dataset(10),
        None,
        training_config(dir.path()),
        device,
    )
    .unwrap();
    trainer.train().unwrap();
    let training_dir = trainer.training_dir().unwrap().to_path_buf();
    let (epoch, checkpoint) = find_latest_checkpoint(&training_dir).unwrap();
    assert_eq!(epoch, 2);

    let checkpoint_model = Rhvae::<TestBackend>::load_from_folder(&checkpoint, &device).unwrap();

    let mut resumed = Trainer::new(
        model_config().init::<TestBackend>(&device).unwrap(),
        dataset(10),
        None,
        training_config(dir.path()).with_num_epochs(4),
        device,
    )
    .unwrap();
    assert_eq!(resumed.resume_from(&training_dir).unwrap(), Some(2));
    check_same_model(resumed.model(), &checkpoint_model);

    resumed.train().unwrap();
    assert_eq!(resumed.training_dir(), Some(training_dir.as_path()));
    assert!(training_dir.join("checkpoint_epoch_4").is_dir());
}

#[test]
fn test_training_pipeline() {
    let device = Default::default();
    for custom in custom_variants() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_config()
            .init_with::<TestBackend>(custom, &device)
            .unwrap();
        let config = training_config(dir.path());
        let mut pipeline = TrainingPipeline::new(model, config.clone(), device);

        assert_eq!(pipeline.training_config().to_string(), config.to_string());

        let data = Tensor::<TestBackend, 2>::random([10, 16], Distribution::Uniform(0.0, 1.0), &device);
        let best = pipeline.run(data.clone(), Some(data)).unwrap();

        let trainer = pipeline.trainer().unwrap();
        let final_dir = trainer.training_dir().unwrap().join(FINAL_MODEL_DIR);
        assert!(final_dir.is_dir());
        check_custom_artifacts(&final_dir, best.model_config());

        let reloaded = Rhvae::<TestBackend>::load_from_folder(&final_dir, &device).unwrap();
        check_same_model(&reloaded, trainer.best_model());
    }
}

#[test]
fn test_training_pipeline_resume() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let data = Tensor::<TestBackend, 2>::random([10, 16], Distribution::Uniform(0.0, 1.0), &device);

    let mut pipeline = TrainingPipeline::new(
        model_config().init::<TestBackend>(&device).unwrap(),
        training_config(dir.path()),
        device,
    );
    pipeline.run(data.clone(), None).unwrap();
    let training_dir = pipeline.trainer().unwrap().training_dir().unwrap().to_path_buf();
    assert_eq!(find_latest_checkpoint(&training_dir).unwrap().0, 2);

    let mut resumed = TrainingPipeline::new(
        model_config().init::<TestBackend>(&device).unwrap(),
        training_config(dir.path()).with_num_epochs(4),
        device,
    )
    .resume_from(&training_dir);
    resumed.run(data, None).unwrap();

    let trainer = resumed.trainer().unwrap();
    assert_eq!(trainer.training_dir(), Some(training_dir.as_path()));
    assert!(training_dir.join("checkpoint_epoch_4").is_dir());
    // No second training directory was created
    assert_eq!(file_names(dir.path()).len(), 1);
}
