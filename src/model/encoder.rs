use crate::error::TrainError;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::activation::relu;
use std::path::Path;

/// Configuration for the pretrained image feature network.
#[derive(Config, Debug)]
pub struct ImageEncoderConfig {
    pub feature_dim: usize,
    pub output_dim: usize,
}

/// Projects precomputed image descriptors into the space the caption model
/// consumes. Its weights normally come from a pretrained checkpoint and stay
/// frozen during training.
#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    projection: Linear<B>,
}

impl ImageEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageEncoder<B> {
        ImageEncoder {
            projection: LinearConfig::new(self.feature_dim, self.output_dim).init(device),
        }
    }
}

impl<B: Backend> ImageEncoder<B> {
    /// `[batch, feature_dim]` -> `[batch, output_dim]`.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        relu(self.projection.forward(features))
    }

    /// Replace the weights with a record saved by `CompactRecorder`.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> crate::error::Result<Self> {
        let record = CompactRecorder::new()
            .load(path.to_path_buf(), device)
            .map_err(|err| {
                TrainError::Checkpoint(format!(
                    "failed to load image encoder weights from {}: {err:?}",
                    path.display()
                ))
            })?;
        Ok(self.load_record(record))
    }
}
