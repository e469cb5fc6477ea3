use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig};
use burn::prelude::*;
use burn::tensor::activation::tanh;

/// Configuration for the caption sequence discriminator.
#[derive(Config, Debug)]
pub struct SequenceDiscriminatorConfig {
    pub vocab_size: usize,
    pub hidden_units: usize,
}

/// Scores a sequence of per-step token distributions as human (positive
/// logit) or generated (negative logit).
#[derive(Module, Debug)]
pub struct SequenceDiscriminator<B: Backend> {
    projection: Linear<B>,
    lstm: Lstm<B>,
    fc_adv: Linear<B>,
}

impl SequenceDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SequenceDiscriminator<B> {
        SequenceDiscriminator {
            projection: LinearConfig::new(self.vocab_size, self.hidden_units).init(device),
            lstm: LstmConfig::new(self.hidden_units, self.hidden_units, true).init(device),
            fc_adv: LinearConfig::new(self.hidden_units, 1).init(device),
        }
    }
}

impl<B: Backend> SequenceDiscriminator<B> {
    /// `sequences` is `[batch, seq, vocab]`, `mask` is `[batch, seq]` with 1 on
    /// real steps. Returns adversarial logits `[batch, 1]`.
    pub fn forward(&self, sequences: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = tanh(self.projection.forward(sequences));
        let (outputs, _) = self.lstm.forward(x, None);
        let [batch, _, hidden] = outputs.dims();

        // Masked mean over time so padding never reaches the score.
        let mask = mask.unsqueeze_dim::<3>(2);
        let lengths = mask.clone().sum_dim(1).clamp_min(1.0);
        let pooled = outputs.mul(mask).sum_dim(1).div(lengths);
        self.fc_adv.forward(pooled.reshape([batch, hidden]))
    }
}
