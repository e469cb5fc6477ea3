#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use burn::prelude::*;
use clap::Parser;
use im2txt_gan::caption::CaptionGenerator as BeamSearch;
use im2txt_gan::checkpoint::CheckpointStore;
use im2txt_gan::config::TrainingConfig;
use im2txt_gan::data::{load_features, read_shard, resolve_shards, PrefetchConfig, Prefetcher};
use im2txt_gan::gan::{CaptionGan, CHECKPOINT_EXTENSION, CHECKPOINT_PREFIX};
use im2txt_gan::logging::init_tracing;
use im2txt_gan::model::ModelConfig;
use im2txt_gan::training::{CaptionSampler, Trainer, TrainerOptions};
use im2txt_gan::validation::ValidationLog;
use im2txt_gan::vocab::Vocabulary;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(about = "Adversarial training of the image caption model")]
struct Args {
    /// Glob of sharded JSON-lines training files.
    #[arg(long)]
    input_file_pattern: String,
    /// Pretrained image encoder weights.
    #[arg(long)]
    inception_checkpoint_file: Option<PathBuf>,
    /// Directory for checkpoints, config.json and valid.txt.
    #[arg(long)]
    train_dir: PathBuf,
    /// Fine-tune the image encoder as part of the generator.
    #[arg(long, default_value_t = false)]
    train_inception: bool,
    /// Number of passes of the outer training loop.
    #[arg(long, default_value_t = 1_000_000)]
    number_of_steps: usize,
    #[arg(long, default_value_t = 1)]
    log_every_n_steps: usize,
    #[arg(long)]
    vocab_file: PathBuf,
    /// JSON array of features for the held-out validation image.
    #[arg(long)]
    valid_features: Option<PathBuf>,
    /// JSON training config overriding the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let vocab = Vocabulary::from_file(&args.vocab_file)
        .with_context(|| format!("failed to load vocabulary from {}", args.vocab_file.display()))?;
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrainingConfig::new(ModelConfig::new(vocab.len())),
    };
    if config.model.vocab_size != vocab.len() {
        tracing::warn!(
            "config vocab_size {} does not match vocabulary ({} words); using the vocabulary",
            config.model.vocab_size,
            vocab.len()
        );
        config.model.vocab_size = vocab.len();
    }
    config.validate()?;

    let shards = resolve_shards(&args.input_file_pattern)?;
    if let Some(path) = &args.inception_checkpoint_file {
        if !path.is_file() {
            anyhow::bail!("inception checkpoint {} does not exist", path.display());
        }
    }

    std::fs::create_dir_all(&args.train_dir)
        .with_context(|| format!("failed to create {}", args.train_dir.display()))?;
    config
        .save(args.train_dir.join("config.json"))
        .context("failed to write config.json")?;

    type TrainBackend = Autodiff<Wgpu<f32, i32>>;
    let device = WgpuDevice::default();
    TrainBackend::seed(&device, config.seed);

    let mut model = config.model.init::<TrainBackend>(&device);
    if let Some(path) = &args.inception_checkpoint_file {
        model.encoder = model.encoder.load_pretrained(path, &device)?;
        tracing::info!("loaded image encoder weights from {}", path.display());
    }

    let search = BeamSearch::new(vocab.start_id(), vocab.end_id())
        .with_beam_size(config.model.beam_size)
        .with_max_caption_length(config.model.max_caption_length)
        .with_length_normalization_factor(config.model.length_normalization_factor);
    let gan = CaptionGan::new(model, &config, args.train_inception, search, device)?;

    let image = validation_image(args.valid_features.as_deref(), &shards[0])?;
    let sampler = CaptionSampler {
        log: ValidationLog::open(&args.train_dir)?,
        vocab,
        image,
    };
    let store = CheckpointStore::new(
        &args.train_dir,
        CHECKPOINT_PREFIX,
        CHECKPOINT_EXTENSION,
        config.max_checkpoints_to_keep,
    )?;
    let prefetcher = Prefetcher::start(
        shards,
        PrefetchConfig {
            batch_size: config.batch_size,
            num_threads: config.num_input_reader_threads,
            queue_capacity: config.input_queue_capacity,
            input_epochs: config.input_epochs,
            seed: config.seed,
        },
    )?;

    let options = TrainerOptions::from_config(&config, args.number_of_steps, args.log_every_n_steps);
    tracing::info!(
        "training {} epochs of {} batches, learning rate {}",
        options.number_of_epochs,
        options.batches_per_epoch,
        config.learning_rate_schedule(args.train_inception).initial
    );

    let mut trainer = Trainer::new(gan, prefetcher, store, sampler, options);
    trainer.resume()?;
    trainer.run()?;
    Ok(())
}

/// Features from `--valid-features`, or those of the first record of the first shard.
fn validation_image(valid_features: Option<&Path>, first_shard: &Path) -> Result<Vec<f32>> {
    if let Some(path) = valid_features {
        return Ok(load_features(path)?);
    }
    let records = read_shard(first_shard)?;
    let record = records
        .into_iter()
        .next()
        .with_context(|| format!("{} holds no usable record", first_shard.display()))?;
    tracing::info!("sampling validation captions for image {}", record.image_id);
    Ok(record.features)
}
