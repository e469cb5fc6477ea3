use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig,
    LstmState,
};
use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Configuration for the LSTM caption decoder.
#[derive(Config, Debug)]
pub struct CaptionGeneratorConfig {
    pub vocab_size: usize,
    pub image_dim: usize,
    pub embedding_size: usize,
    pub num_lstm_units: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

/// Show-and-tell decoder: the image embedding primes the LSTM, then words are
/// fed one per step.
#[derive(Module, Debug)]
pub struct CaptionGenerator<B: Backend> {
    image_embedding: Linear<B>,
    word_embedding: Embedding<B>,
    lstm: Lstm<B>,
    dropout: Dropout,
    logits: Linear<B>,
    #[module(ignore)]
    vocab_size: usize,
    #[module(ignore)]
    num_lstm_units: usize,
}

impl CaptionGeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CaptionGenerator<B> {
        CaptionGenerator {
            image_embedding: LinearConfig::new(self.image_dim, self.embedding_size).init(device),
            word_embedding: EmbeddingConfig::new(self.vocab_size, self.embedding_size).init(device),
            lstm: LstmConfig::new(self.embedding_size, self.num_lstm_units, true).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            logits: LinearConfig::new(self.num_lstm_units, self.vocab_size).init(device),
            vocab_size: self.vocab_size,
            num_lstm_units: self.num_lstm_units,
        }
    }
}

impl<B: Backend> CaptionGenerator<B> {
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn num_lstm_units(&self) -> usize {
        self.num_lstm_units
    }

    /// Run the image embedding through the LSTM and return the resulting state.
    pub fn feed_image(&self, image: Tensor<B, 2>) -> LstmState<B, 2> {
        let embedded = self.image_embedding.forward(image).unsqueeze_dim::<3>(1);
        let (_, state) = self.lstm.forward(embedded, None);
        state
    }

    /// Teacher-forced logits `[batch, seq, vocab]` for `input_seqs`.
    pub fn forward(&self, image: Tensor<B, 2>, input_seqs: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let state = self.feed_image(image);
        let words = self.dropout.forward(self.word_embedding.forward(input_seqs));
        let (outputs, _) = self.lstm.forward(words, Some(state));
        self.logits.forward(self.dropout.forward(outputs))
    }

    /// One decoding step: next-token probabilities `[batch, vocab]` and the new state.
    pub fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: LstmState<B, 2>,
    ) -> (Tensor<B, 2>, LstmState<B, 2>) {
        let words = self.word_embedding.forward(tokens.unsqueeze_dim::<2>(1));
        let (outputs, state) = self.lstm.forward(words, Some(state));
        let logits = self.logits.forward(outputs);
        let [batch, _, vocab] = logits.dims();
        (softmax(logits.reshape([batch, vocab]), 1), state)
    }
}
