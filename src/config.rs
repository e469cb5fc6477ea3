use crate::error::TrainError;
use crate::model::ModelConfig;
use burn::config::Config;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{AdamConfig, SgdConfig};
use burn::prelude::*;
use burn::record::Record;
use serde::{Deserialize, Serialize};

/// Optimizer used for every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD")]
    Sgd,
    Adam,
}

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = 32)]
    pub batch_size: usize,
    /// Number of examples in one pass over the training shards.
    #[config(default = 586363)]
    pub num_examples_per_epoch: usize,
    #[config(default = "OptimizerKind::Sgd")]
    pub optimizer: OptimizerKind,
    #[config(default = 2.0)]
    pub initial_learning_rate: f64,
    /// Staircase decay factor; 0 disables decay.
    #[config(default = 0.5)]
    pub learning_rate_decay_factor: f64,
    #[config(default = 8.0)]
    pub num_epochs_per_decay: f64,
    /// Constant rate used when the image encoder is fine-tuned.
    #[config(default = 0.0005)]
    pub train_inception_learning_rate: f64,
    /// Global L2 norm each update's gradients are clipped to; 0 disables clipping.
    #[config(default = 5.0)]
    pub clip_gradients: f64,
    #[config(default = 5)]
    pub max_checkpoints_to_keep: usize,
    /// NLL loss above which an iteration runs the pretrain branch.
    #[config(default = 3.5)]
    pub nll_threshold: f64,
    #[config(default = 500)]
    pub checkpoint_every: usize,
    #[config(default = 2)]
    pub num_input_reader_threads: usize,
    /// Capacity of the prefetch queue, in batches.
    #[config(default = 8)]
    pub input_queue_capacity: usize,
    /// Passes over the shards before input is exhausted; `None` reads forever.
    pub input_epochs: Option<usize>,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn batches_per_epoch(&self) -> usize {
        (self.num_examples_per_epoch / self.batch_size.max(1)).max(1)
    }

    /// Reject values the trainer cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(TrainError::Config(msg.to_string()));
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.max_checkpoints_to_keep == 0 {
            return invalid("max_checkpoints_to_keep must be at least 1");
        }
        if self.num_input_reader_threads == 0 {
            return invalid("num_input_reader_threads must be at least 1");
        }
        if self.input_queue_capacity == 0 {
            return invalid("input_queue_capacity must be at least 1");
        }
        if !(self.initial_learning_rate > 0.0) {
            return invalid("initial_learning_rate must be positive");
        }
        if self.model.vocab_size < 3 {
            return invalid("vocab_size must cover start, end and unknown words");
        }
        Ok(())
    }

    /// Learning-rate schedule for this run.
    pub fn learning_rate_schedule(&self, train_encoder: bool) -> LearningRateSchedule {
        if train_encoder {
            return LearningRateSchedule::constant(self.train_inception_learning_rate);
        }
        if self.learning_rate_decay_factor > 0.0 {
            let decay_steps = (self.batches_per_epoch() as f64 * self.num_epochs_per_decay) as usize;
            LearningRateSchedule {
                initial: self.initial_learning_rate,
                decay_factor: self.learning_rate_decay_factor,
                decay_steps: Some(decay_steps.max(1)),
                step: 0,
            }
        } else {
            LearningRateSchedule::constant(self.initial_learning_rate)
        }
    }

    // Gradients reach the optimizers already clipped by global norm.
    pub fn sgd_config(&self) -> SgdConfig {
        SgdConfig::new()
    }

    pub fn adam_config(&self) -> AdamConfig {
        AdamConfig::new()
    }
}

/// Staircase exponential decay: `initial * factor^(step / decay_steps)`.
///
/// `step` is the trainer counter the next call to [`LrScheduler::step`]
/// reports a rate for; [`LearningRateSchedule::seek`] moves it.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRateSchedule {
    pub initial: f64,
    pub decay_factor: f64,
    pub decay_steps: Option<usize>,
    pub step: usize,
}

#[derive(Record, Clone)]
pub struct LearningRateRecord {
    step: usize,
}

impl LearningRateSchedule {
    pub fn constant(rate: f64) -> Self {
        Self {
            initial: rate,
            decay_factor: 1.0,
            decay_steps: None,
            step: 0,
        }
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        match self.decay_steps {
            Some(decay_steps) if decay_steps > 0 => {
                let exponent = (step / decay_steps) as i32;
                self.initial * self.decay_factor.powi(exponent)
            }
            _ => self.initial,
        }
    }

    pub fn seek(&mut self, step: usize) {
        self.step = step;
    }
}

impl LrScheduler for LearningRateSchedule {
    type Record<B: Backend> = LearningRateRecord;

    fn step(&mut self) -> f64 {
        let lr = self.learning_rate(self.step);
        self.step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        LearningRateRecord { step: self.step }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.step = record.step;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new(100))
            .with_batch_size(10)
            .with_num_examples_per_epoch(1000)
            .with_num_epochs_per_decay(2.0)
    }

    #[test]
    fn test_batches_per_epoch() {
        assert_eq!(config().batches_per_epoch(), 100);
        assert_eq!(config().with_num_examples_per_epoch(3).batches_per_epoch(), 1);
    }

    #[test]
    fn test_staircase_decay() {
        let schedule = config().learning_rate_schedule(false);
        assert_eq!(schedule.decay_steps, Some(200));
        assert_eq!(schedule.learning_rate(0), 2.0);
        assert_eq!(schedule.learning_rate(199), 2.0);
        assert_eq!(schedule.learning_rate(200), 1.0);
        assert_eq!(schedule.learning_rate(650), 0.25);
    }

    #[test]
    fn test_fine_tuning_uses_constant_rate() {
        let schedule = config().learning_rate_schedule(true);
        assert_eq!(schedule.learning_rate(0), 0.0005);
        assert_eq!(schedule.learning_rate(1_000_000), 0.0005);
    }

    #[test]
    fn test_no_decay_when_factor_is_zero() {
        let schedule = config()
            .with_learning_rate_decay_factor(0.0)
            .learning_rate_schedule(false);
        assert_eq!(schedule.learning_rate(10_000), 2.0);
    }

    #[test]
    fn test_scheduler_steps_from_seek_position() {
        let mut schedule = config().learning_rate_schedule(false);
        schedule.seek(199);
        assert_eq!(LrScheduler::step(&mut schedule), 2.0);
        assert_eq!(LrScheduler::step(&mut schedule), 1.0);

        let record = schedule.to_record::<burn::backend::NdArray>();
        let restored = config()
            .learning_rate_schedule(false)
            .load_record::<burn::backend::NdArray>(record);
        assert_eq!(restored.step, 201);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        assert!(config().validate().is_ok());
        assert!(matches!(
            config().with_batch_size(0).validate(),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config().with_optimizer(OptimizerKind::Adam).save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.optimizer, OptimizerKind::Adam);
        assert_eq!(loaded.batch_size, 10);
        assert_eq!(loaded.model.vocab_size, 100);
        assert_eq!(loaded.input_epochs, None);
    }
}
