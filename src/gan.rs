use crate::caption::{Caption, CaptionGenerator as BeamSearch, StepModel};
use crate::checkpoint::Snapshot;
use crate::config::{LearningRateSchedule, OptimizerKind, TrainingConfig};
use crate::data::CaptionBatch;
use crate::error::{Result, TrainError};
use crate::model::partition::{clip_factor, param_ids};
use crate::model::{compute_losses, BatchTensors, CaptionModel, ParamGroup, ParamPartition};
use burn::module::AutodiffModule;
use burn::nn::LstmState;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use std::path::Path;

pub const CHECKPOINT_PREFIX: &str = "im2txt";
/// File extension written by `CompactRecorder`.
pub const CHECKPOINT_EXTENSION: &str = "mpk";

/// What a single optimization step minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Masked negative log-likelihood of the target captions.
    Nll,
    /// Real/fake classification loss of the discriminator.
    Discriminator,
    /// `g_loss + nll_loss` for the generator.
    GeneratorAdversarial,
}

impl Objective {
    /// The only partition a step with this objective may update.
    pub fn group(self) -> ParamGroup {
        match self {
            Objective::Nll | Objective::GeneratorAdversarial => ParamGroup::Generator,
            Objective::Discriminator => ParamGroup::Discriminator,
        }
    }
}

/// Loss and metric values computed during one step, before the update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub nll_loss: f64,
    pub g_loss: f64,
    pub d_loss: f64,
    /// Discriminator accuracy on the step's real and generated sequences.
    pub accuracy: f64,
}

/// The capabilities the trainer needs from a generator/discriminator pair.
pub trait AdversarialModel {
    type Batch;
    type Image;

    /// Compute losses on `batch` and apply gradients of `objective` to its
    /// partition only. `step` is the trainer's counter, used for the
    /// learning-rate schedule.
    fn train_step(&mut self, objective: Objective, batch: &Self::Batch, step: usize) -> Result<StepReport>;

    /// Beam-search captions for one image.
    fn generate(&self, image: &Self::Image) -> Result<Vec<Caption>>;
}

/// Object-safe view of a burn optimizer bound to one sub-module type.
trait ModuleOptimizer<M, B: AutodiffBackend> {
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
}

impl<M, B, O> ModuleOptimizer<M, B> for O
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
    O: Optimizer<M, B>,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }
}

type BoxedOptimizer<M, B> = Box<dyn ModuleOptimizer<M, B>>;

fn init_optimizer<B, M>(config: &TrainingConfig) -> BoxedOptimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + 'static,
{
    match config.optimizer {
        OptimizerKind::Sgd => Box::new(config.sgd_config().init::<B, M>()),
        OptimizerKind::Adam => Box::new(config.adam_config().init::<B, M>()),
    }
}

/// Tag encoder, generator and discriminator parameters and check the result
/// covers the whole model exactly once.
pub fn build_partition<B: Backend>(model: &CaptionModel<B>, train_encoder: bool) -> Result<ParamPartition> {
    let encoder_group = if train_encoder {
        ParamGroup::Generator
    } else {
        ParamGroup::Frozen
    };
    let mut partition = ParamPartition::default();
    partition.tag::<B, _>(&model.encoder, encoder_group)?;
    partition.tag::<B, _>(&model.generator, ParamGroup::Generator)?;
    partition.tag::<B, _>(&model.discriminator, ParamGroup::Discriminator)?;
    partition.validate_covers(&param_ids::<B, _>(model))?;
    Ok(partition)
}

/// Burn implementation of [`AdversarialModel`] with one optimizer per partition.
pub struct CaptionGan<B: AutodiffBackend> {
    model: CaptionModel<B>,
    config: TrainingConfig,
    train_encoder: bool,
    optim_gen: BoxedOptimizer<crate::model::CaptionGenerator<B>, B>,
    optim_disc: BoxedOptimizer<crate::model::SequenceDiscriminator<B>, B>,
    optim_encoder: Option<BoxedOptimizer<crate::model::ImageEncoder<B>, B>>,
    schedule: LearningRateSchedule,
    partition: ParamPartition,
    search: BeamSearch,
    device: B::Device,
}

impl<B: AutodiffBackend> CaptionGan<B> {
    pub fn new(
        model: CaptionModel<B>,
        config: &TrainingConfig,
        train_encoder: bool,
        search: BeamSearch,
        device: B::Device,
    ) -> Result<Self> {
        let model = freeze_encoder(model, train_encoder);
        let partition = build_partition(&model, train_encoder)?;
        tracing::info!(
            "parameter partition: {} generator, {} discriminator, {} frozen",
            partition.count(ParamGroup::Generator),
            partition.count(ParamGroup::Discriminator),
            partition.count(ParamGroup::Frozen)
        );

        Ok(Self {
            model,
            config: config.clone(),
            train_encoder,
            optim_gen: init_optimizer::<B, _>(config),
            optim_disc: init_optimizer::<B, _>(config),
            optim_encoder: train_encoder.then(|| init_optimizer::<B, _>(config)),
            schedule: config.learning_rate_schedule(train_encoder),
            partition,
            search,
            device,
        })
    }

    pub fn model(&self) -> &CaptionModel<B> {
        &self.model
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        self.schedule.learning_rate(step)
    }

    pub fn partition(&self) -> &ParamPartition {
        &self.partition
    }
}

fn freeze_encoder<B: AutodiffBackend>(mut model: CaptionModel<B>, train_encoder: bool) -> CaptionModel<B> {
    if !train_encoder {
        model.encoder = model.encoder.no_grad();
    }
    model
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

impl<B: AutodiffBackend> AdversarialModel for CaptionGan<B> {
    type Batch = CaptionBatch;
    type Image = Vec<f32>;

    fn train_step(&mut self, objective: Objective, batch: &CaptionBatch, step: usize) -> Result<StepReport> {
        let group = objective.group();
        if group == ParamGroup::Frozen {
            return Err(TrainError::Model(format!(
                "objective {objective:?} targets frozen parameters"
            )));
        }
        self.schedule.seek(step);
        let lr = self.schedule.step();

        let tensors = BatchTensors::from_batch(batch, &self.device);
        let losses = compute_losses(&self.model, tensors);

        let report = StepReport {
            nll_loss: scalar(losses.nll_loss.clone()),
            g_loss: scalar(losses.g_loss.clone()),
            d_loss: scalar(losses.d_loss.clone()),
            accuracy: losses.accuracy,
        };

        let loss = match objective {
            Objective::Nll => losses.nll_loss,
            Objective::Discriminator => losses.d_loss,
            Objective::GeneratorAdversarial => losses.g_loss.add(losses.nll_loss),
        };
        let mut grads = GradientsParams::from_grads(loss.backward(), &self.model);

        match group {
            ParamGroup::Generator => {
                let mut gen_grads = self
                    .partition
                    .extract_grads(&self.model.generator, group, &mut grads);
                let mut encoder_grads = self
                    .partition
                    .extract_grads(&self.model.encoder, group, &mut grads);
                let squared_norm = gen_grads.squared_norm + encoder_grads.squared_norm;
                if let Some(scale) = clip_factor(squared_norm, self.config.clip_gradients) {
                    gen_grads.scale(&self.model.generator, scale);
                    encoder_grads.scale(&self.model.encoder, scale);
                }

                self.model.generator = self
                    .optim_gen
                    .step(lr, self.model.generator.clone(), gen_grads.grads);
                if let Some(optim) = self.optim_encoder.as_mut() {
                    self.model.encoder = optim.step(lr, self.model.encoder.clone(), encoder_grads.grads);
                }
            }
            _ => {
                let mut disc_grads = self
                    .partition
                    .extract_grads(&self.model.discriminator, group, &mut grads);
                if let Some(scale) = clip_factor(disc_grads.squared_norm, self.config.clip_gradients) {
                    disc_grads.scale(&self.model.discriminator, scale);
                }
                self.model.discriminator = self
                    .optim_disc
                    .step(lr, self.model.discriminator.clone(), disc_grads.grads);
            }
        }

        Ok(report)
    }

    fn generate(&self, image: &Vec<f32>) -> Result<Vec<Caption>> {
        let step_model = BurnStepModel {
            model: self.model.valid(),
            device: self.device.clone(),
        };
        self.search.beam_search(&step_model, image)
    }
}

impl<B: AutodiffBackend> Snapshot for CaptionGan<B> {
    fn save_to(&self, path: &Path) -> Result<()> {
        self.model
            .clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())
            .map_err(|err| {
                TrainError::Checkpoint(format!("failed to save {}: {err:?}", path.display()))
            })
    }

    fn load_from(&mut self, path: &Path) -> Result<()> {
        let model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &CompactRecorder::new(), &self.device)
            .map_err(|err| {
                TrainError::Checkpoint(format!("failed to load {}: {err:?}", path.display()))
            })?;

        // Loaded parameters carry the ids stored in the record, so the
        // partition and the optimizers keyed by them start over.
        self.model = freeze_encoder(model, self.train_encoder);
        self.partition = build_partition(&self.model, self.train_encoder)?;
        self.optim_gen = init_optimizer::<B, _>(&self.config);
        self.optim_disc = init_optimizer::<B, _>(&self.config);
        self.optim_encoder = self
            .train_encoder
            .then(|| init_optimizer::<B, _>(&self.config));
        Ok(())
    }
}

/// Single-image decoding on the inference copy of the model. The LSTM state
/// is flattened as `[cell, hidden]`.
pub struct BurnStepModel<B: Backend> {
    pub model: CaptionModel<B>,
    pub device: B::Device,
}

impl<B: Backend> BurnStepModel<B> {
    fn units(&self) -> usize {
        self.model.generator.num_lstm_units()
    }
}

fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| TrainError::Model(format!("cannot read tensor data: {err:?}")))
}

impl<B: Backend> StepModel for BurnStepModel<B> {
    fn initial_state(&self, image: &[f32]) -> Result<Vec<f32>> {
        let features = Tensor::<B, 2>::from_data(
            TensorData::new(image.to_vec(), [1, image.len()]),
            &self.device,
        );
        let state = self
            .model
            .generator
            .feed_image(self.model.encoder.forward(features));
        let mut flat = to_vec(state.cell)?;
        flat.extend(to_vec(state.hidden)?);
        Ok(flat)
    }

    fn step(&self, tokens: &[usize], states: &[Vec<f32>]) -> Result<Vec<(Vec<f32>, Vec<f32>)>> {
        let batch = tokens.len();
        let units = self.units();
        let mut cell = Vec::with_capacity(batch * units);
        let mut hidden = Vec::with_capacity(batch * units);
        for state in states {
            if state.len() != 2 * units {
                return Err(TrainError::Model(format!(
                    "decoder state has {} values, expected {}",
                    state.len(),
                    2 * units
                )));
            }
            cell.extend_from_slice(&state[..units]);
            hidden.extend_from_slice(&state[units..]);
        }

        let ids = tokens.iter().map(|&id| id as i64).collect::<Vec<_>>();
        let tokens = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [batch]), &self.device);
        let state = LstmState::new(
            Tensor::from_data(TensorData::new(cell, [batch, units]), &self.device),
            Tensor::from_data(TensorData::new(hidden, [batch, units]), &self.device),
        );
        let (probs, state) = self.model.generator.step(tokens, state);

        let vocab = probs.dims()[1];
        let probs = to_vec(probs)?;
        let cell = to_vec(state.cell)?;
        let hidden = to_vec(state.hidden)?;

        Ok((0..batch)
            .map(|row| {
                let mut next = cell[row * units..(row + 1) * units].to_vec();
                next.extend_from_slice(&hidden[row * units..(row + 1) * units]);
                (probs[row * vocab..(row + 1) * vocab].to_vec(), next)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CaptionRecord;
    use crate::model::ModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{ModuleVisitor, Param};
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray>;
    type Inner = NdArray;

    fn config() -> TrainingConfig {
        let model = ModelConfig::new(7)
            .with_feature_dim(4)
            .with_image_feature_dim(6)
            .with_embedding_size(5)
            .with_num_lstm_units(8)
            .with_discriminator_units(3);
        TrainingConfig::new(model)
            .with_batch_size(2)
            .with_num_examples_per_epoch(4)
            .with_initial_learning_rate(0.5)
    }

    fn gan(train_encoder: bool) -> CaptionGan<TestBackend> {
        let config = config();
        let device = Default::default();
        let model = config.model.init::<TestBackend>(&device);
        let search = BeamSearch::new(0, 1).with_max_caption_length(5);
        CaptionGan::new(model, &config, train_encoder, search, device).unwrap()
    }

    fn batch() -> CaptionBatch {
        CaptionBatch::from_records(&[
            CaptionRecord {
                image_id: 1,
                features: vec![0.1, 0.2, 0.3, 0.4],
                caption: vec![0, 3, 4, 1],
            },
            CaptionRecord {
                image_id: 2,
                features: vec![0.4, 0.3, 0.2, 0.1],
                caption: vec![0, 5, 1],
            },
        ])
        .unwrap()
    }

    /// Outputs of each sub-network on fixed inputs, used to detect updates.
    fn fingerprint(gan: &CaptionGan<TestBackend>) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let model: CaptionModel<Inner> = gan.model().valid();
        let device = Default::default();
        let tensors = BatchTensors::<Inner>::from_batch(&batch(), &device);
        let image = model.encoder.forward(tensors.features.clone());
        let logits = model
            .generator
            .forward(image.clone(), tensors.input_seqs.clone());
        let sequences = tensors.target_seqs.clone().one_hot::<3>(7).float();
        let scores = model.discriminator.forward(sequences, tensors.mask);
        (
            to_vec(image).unwrap(),
            to_vec(logits).unwrap(),
            to_vec(scores).unwrap(),
        )
    }

    /// `CompactRecorder` keeps half precision.
    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-2, "{x} vs {y}");
        }
    }

    #[test]
    fn test_objectives_map_to_one_partition() {
        assert_eq!(Objective::Nll.group(), ParamGroup::Generator);
        assert_eq!(Objective::GeneratorAdversarial.group(), ParamGroup::Generator);
        assert_eq!(Objective::Discriminator.group(), ParamGroup::Discriminator);
    }

    #[test]
    fn test_frozen_encoder_is_excluded_unless_fine_tuning() {
        let frozen = gan(false);
        assert_eq!(frozen.partition().count(ParamGroup::Frozen), 2);

        let tuned = gan(true);
        assert_eq!(tuned.partition().count(ParamGroup::Frozen), 0);
        assert_eq!(
            tuned.partition().count(ParamGroup::Generator),
            frozen.partition().count(ParamGroup::Generator) + 2
        );
    }

    #[test]
    fn test_generator_step_leaves_discriminator_and_encoder() {
        let mut gan = gan(false);
        let (image, logits, scores) = fingerprint(&gan);

        let report = gan.train_step(Objective::Nll, &batch(), 1).unwrap();
        assert!(report.nll_loss.is_finite());

        let (image_after, logits_after, scores_after) = fingerprint(&gan);
        assert_eq!(image, image_after);
        assert_eq!(scores, scores_after);
        assert_ne!(logits, logits_after);
    }

    #[test]
    fn test_discriminator_step_leaves_generator() {
        let mut gan = gan(false);
        let (image, logits, scores) = fingerprint(&gan);

        let report = gan.train_step(Objective::Discriminator, &batch(), 1).unwrap();
        assert!((0.0..=1.0).contains(&report.accuracy));

        let (image_after, logits_after, scores_after) = fingerprint(&gan);
        assert_eq!(image, image_after);
        assert_eq!(logits, logits_after);
        assert_ne!(scores, scores_after);
    }

    #[test]
    fn test_fine_tuning_updates_encoder() {
        let mut gan = gan(true);
        let (image, _, _) = fingerprint(&gan);
        gan.train_step(Objective::GeneratorAdversarial, &batch(), 1)
            .unwrap();
        let (image_after, _, _) = fingerprint(&gan);
        assert_ne!(image, image_after);
    }

    struct ParamValues {
        values: Vec<f32>,
    }

    impl ModuleVisitor<Inner> for ParamValues {
        fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Inner, D>>) {
            self.values.extend(to_vec(param.val()).unwrap());
        }
    }

    fn discriminator_values(gan: &CaptionGan<TestBackend>) -> Vec<f32> {
        let mut visitor = ParamValues { values: Vec::new() };
        gan.model().valid().discriminator.visit(&mut visitor);
        visitor.values
    }

    #[test]
    fn test_update_is_clipped_by_global_norm() {
        let device = Default::default();
        let model = config().model.init::<TestBackend>(&device);
        let search = BeamSearch::new(0, 1).with_max_caption_length(5);
        let clipped_config = config().with_clip_gradients(1e-4);
        let mut clipped =
            CaptionGan::new(model.clone(), &clipped_config, false, search.clone(), device.clone()).unwrap();
        let mut free =
            CaptionGan::new(model, &config().with_clip_gradients(0.0), false, search, device).unwrap();

        let before = discriminator_values(&clipped);
        clipped.train_step(Objective::Discriminator, &batch(), 1).unwrap();
        free.train_step(Objective::Discriminator, &batch(), 1).unwrap();

        let delta = |after: Vec<f32>| {
            after
                .iter()
                .zip(&before)
                .map(|(a, b)| ((a - b) as f64).powi(2))
                .sum::<f64>()
                .sqrt()
        };
        // SGD moves by lr * grad, so the clipped step is at most 0.5 * 1e-4 long.
        let clipped_delta = delta(discriminator_values(&clipped));
        let free_delta = delta(discriminator_values(&free));
        assert!(clipped_delta <= 5e-5 + 1e-6, "{clipped_delta}");
        assert!(free_delta > clipped_delta, "{free_delta} vs {clipped_delta}");
    }

    #[test]
    fn test_snapshot_round_trip_restores_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("im2txt-3.{CHECKPOINT_EXTENSION}"));

        let mut trained = gan(false);
        trained.train_step(Objective::Nll, &batch(), 1).unwrap();
        trained.save_to(&path).unwrap();
        assert!(path.is_file());

        let mut restored = gan(false);
        restored.load_from(&path).unwrap();
        let (image, logits, scores) = fingerprint(&trained);
        let (image_r, logits_r, scores_r) = fingerprint(&restored);
        assert_close(&image, &image_r);
        assert_close(&logits, &logits_r);
        assert_close(&scores, &scores_r);
        assert_eq!(restored.partition().count(ParamGroup::Frozen), 2);
    }

    #[test]
    fn test_generate_returns_ranked_captions() {
        let gan = gan(false);
        let captions = gan.generate(&vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert!(!captions.is_empty());
        assert!(captions.len() <= 3);
        for pair in captions.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(captions[0].sentence[0], 0);
    }
}
