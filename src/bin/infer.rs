#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::Wgpu;
use burn::config::Config;
use burn::prelude::*;
use burn::record::CompactRecorder;
use clap::Parser;
use im2txt_gan::caption::CaptionGenerator as BeamSearch;
use im2txt_gan::checkpoint::CheckpointStore;
use im2txt_gan::config::TrainingConfig;
use im2txt_gan::data::load_features;
use im2txt_gan::gan::{BurnStepModel, CHECKPOINT_EXTENSION, CHECKPOINT_PREFIX};
use im2txt_gan::logging::init_tracing;
use im2txt_gan::validation::format_caption;
use im2txt_gan::vocab::Vocabulary;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Caption one image with the latest checkpoint")]
struct Args {
    /// Training directory holding config.json and the checkpoints.
    #[arg(long)]
    train_dir: PathBuf,
    #[arg(long)]
    vocab_file: PathBuf,
    /// JSON array of precomputed image features.
    #[arg(long)]
    features: PathBuf,
    #[arg(long)]
    beam_size: Option<usize>,
    #[arg(long)]
    max_caption_length: Option<usize>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config_path = args.train_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let vocab = Vocabulary::from_file(&args.vocab_file)
        .with_context(|| format!("failed to load vocabulary from {}", args.vocab_file.display()))?;
    if vocab.len() != config.model.vocab_size {
        anyhow::bail!(
            "vocabulary has {} words but the model was trained with {}",
            vocab.len(),
            config.model.vocab_size
        );
    }

    let store = CheckpointStore::new(
        &args.train_dir,
        CHECKPOINT_PREFIX,
        CHECKPOINT_EXTENSION,
        config.max_checkpoints_to_keep,
    )?;
    let checkpoint = store
        .latest()?
        .with_context(|| format!("no checkpoint found in {}", args.train_dir.display()))?;
    println!("using checkpoint {}", checkpoint.name());

    type InferBackend = Wgpu<f32, i32>;
    let device = WgpuDevice::default();
    let model = config
        .model
        .init::<InferBackend>(&device)
        .load_file(checkpoint.path.clone(), &CompactRecorder::new(), &device)
        .map_err(|err| anyhow::anyhow!("failed to load {}: {err:?}", checkpoint.path.display()))?;

    let features = load_features(&args.features)?;
    if features.len() != config.model.feature_dim {
        anyhow::bail!(
            "{} holds {} features, expected {}",
            args.features.display(),
            features.len(),
            config.model.feature_dim
        );
    }

    let search = BeamSearch::new(vocab.start_id(), vocab.end_id())
        .with_beam_size(args.beam_size.unwrap_or(config.model.beam_size))
        .with_max_caption_length(
            args.max_caption_length
                .unwrap_or(config.model.max_caption_length),
        )
        .with_length_normalization_factor(config.model.length_normalization_factor);
    let step_model = BurnStepModel { model, device };
    let captions = search.beam_search(&step_model, &features)?;

    println!("Captions for {}:", args.features.display());
    for (index, caption) in captions.iter().enumerate() {
        println!("{}", format_caption(index, caption, &vocab));
    }
    Ok(())
}
