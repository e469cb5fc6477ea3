pub mod discriminator;
pub mod encoder;
pub mod generator;
pub mod partition;

use crate::data::CaptionBatch;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::TensorData;

pub use discriminator::{SequenceDiscriminator, SequenceDiscriminatorConfig};
pub use encoder::{ImageEncoder, ImageEncoderConfig};
pub use generator::{CaptionGenerator, CaptionGeneratorConfig};
pub use partition::{ParamGroup, ParamPartition};

/// Hyperparameters for the encoder, generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Size of the precomputed image descriptors in the input records.
    #[config(default = 2048)]
    pub feature_dim: usize,
    #[config(default = 1024)]
    pub image_feature_dim: usize,
    #[config(default = 512)]
    pub embedding_size: usize,
    #[config(default = 512)]
    pub num_lstm_units: usize,
    #[config(default = 0.3)]
    pub lstm_dropout: f64,
    #[config(default = 256)]
    pub discriminator_units: usize,
    #[config(default = 3)]
    pub beam_size: usize,
    #[config(default = 20)]
    pub max_caption_length: usize,
    #[config(default = 0.0)]
    pub length_normalization_factor: f64,
}

impl ModelConfig {
    pub fn encoder_config(&self) -> ImageEncoderConfig {
        ImageEncoderConfig::new(self.feature_dim, self.image_feature_dim)
    }

    pub fn generator_config(&self) -> CaptionGeneratorConfig {
        CaptionGeneratorConfig::new(
            self.vocab_size,
            self.image_feature_dim,
            self.embedding_size,
            self.num_lstm_units,
        )
        .with_dropout(self.lstm_dropout)
    }

    pub fn discriminator_config(&self) -> SequenceDiscriminatorConfig {
        SequenceDiscriminatorConfig::new(self.vocab_size, self.discriminator_units)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CaptionModel<B> {
        CaptionModel {
            encoder: self.encoder_config().init(device),
            generator: self.generator_config().init(device),
            discriminator: self.discriminator_config().init(device),
        }
    }
}

/// All trainable and frozen networks of the captioning GAN.
#[derive(Module, Debug)]
pub struct CaptionModel<B: Backend> {
    pub encoder: ImageEncoder<B>,
    pub generator: CaptionGenerator<B>,
    pub discriminator: SequenceDiscriminator<B>,
}

/// A `CaptionBatch` moved onto a device.
#[derive(Clone, Debug)]
pub struct BatchTensors<B: Backend> {
    pub features: Tensor<B, 2>,
    pub input_seqs: Tensor<B, 2, Int>,
    pub target_seqs: Tensor<B, 2, Int>,
    pub mask: Tensor<B, 2>,
}

impl<B: Backend> BatchTensors<B> {
    pub fn from_batch(batch: &CaptionBatch, device: &B::Device) -> Self {
        let shape = [batch.batch_size, batch.seq_len];
        let features = Tensor::<B, 2>::from_data(
            TensorData::new(batch.features.clone(), [batch.batch_size, batch.feature_dim]),
            device,
        );
        let input_seqs = Tensor::<B, 2, Int>::from_data(
            TensorData::new(batch.input_seqs.clone(), shape),
            device,
        );
        let target_seqs = Tensor::<B, 2, Int>::from_data(
            TensorData::new(batch.target_seqs.clone(), shape),
            device,
        );
        let mask = Tensor::<B, 2>::from_data(TensorData::new(batch.mask.clone(), shape), device);
        Self {
            features,
            input_seqs,
            target_seqs,
            mask,
        }
    }
}

/// Loss terms for one batch plus the discriminator accuracy.
#[derive(Debug)]
pub struct CaptionLosses<B: Backend> {
    /// Masked mean negative log-likelihood of the target words.
    pub nll_loss: Tensor<B, 1>,
    pub d_loss: Tensor<B, 1>,
    /// Cheat loss: the generator wants its sequences labelled real.
    pub g_loss: Tensor<B, 1>,
    /// Fraction of real and generated sequences the discriminator labels correctly.
    pub accuracy: f64,
}

/// Compute all loss terms for a batch.
///
/// The discriminator compares human captions (one-hot targets) with the
/// generator's per-step softmax over the same positions, so the generator
/// receives gradients through the adversarial term.
pub fn compute_losses<B: Backend>(model: &CaptionModel<B>, batch: BatchTensors<B>) -> CaptionLosses<B> {
    let device = batch.features.device();
    let vocab_size = model.generator.vocab_size();

    let image = model.encoder.forward(batch.features);
    let logits = model.generator.forward(image, batch.input_seqs);

    let log_probs = log_softmax(logits.clone(), 2);
    let picked = log_probs
        .gather(2, batch.target_seqs.clone().unsqueeze_dim::<3>(2))
        .squeeze_dim::<2>(2);
    let nll_loss = picked
        .mul(batch.mask.clone())
        .sum()
        .neg()
        .div(batch.mask.clone().sum().clamp_min(1.0));

    let real_sequences = batch.target_seqs.one_hot::<3>(vocab_size).float();
    let generated_sequences = softmax(logits, 2);

    let real_logits = model
        .discriminator
        .forward(real_sequences, batch.mask.clone());
    let fake_logits = model.discriminator.forward(generated_sequences, batch.mask);

    let adv_loss_fn = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);
    let ones = Tensor::<B, 2, Int>::ones(real_logits.dims(), &device);
    let zeros = Tensor::<B, 2, Int>::zeros(fake_logits.dims(), &device);
    let d_loss_real = adv_loss_fn.forward(real_logits.clone(), ones);
    let d_loss_fake = adv_loss_fn.forward(fake_logits.clone(), zeros);
    let d_loss = d_loss_real.add(d_loss_fake);
    let g_loss = adv_loss_fn.forward(
        fake_logits.clone(),
        Tensor::<B, 2, Int>::ones(fake_logits.dims(), &device),
    );

    let accuracy = discriminator_accuracy(real_logits, fake_logits);

    CaptionLosses {
        nll_loss,
        d_loss,
        g_loss,
        accuracy,
    }
}

/// Real sequences count as correct when their logit is >= 0, generated ones when < 0.
fn discriminator_accuracy<B: Backend>(real_logits: Tensor<B, 2>, fake_logits: Tensor<B, 2>) -> f64 {
    let total = (real_logits.dims()[0] + fake_logits.dims()[0]) as f64;
    if total == 0.0 {
        return 0.0;
    }
    let real_hits = real_logits
        .greater_equal_elem(0.0)
        .int()
        .sum()
        .into_scalar()
        .elem::<f64>();
    let fake_hits = fake_logits
        .lower_elem(0.0)
        .int()
        .sum()
        .into_scalar()
        .elem::<f64>();
    (real_hits + fake_hits) / total
}
