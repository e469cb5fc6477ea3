use crate::checkpoint::{CheckpointId, CheckpointStore, Snapshot};
use crate::config::TrainingConfig;
use crate::data::{CaptionBatch, Prefetcher};
use crate::error::Result;
use crate::gan::{AdversarialModel, Objective};
use crate::logging::{format_progress, MetricValue};
use crate::validation::{SampleHeader, ValidationLog};
use crate::vocab::Vocabulary;
use std::time::Instant;

/// Generator updates per discriminator update in the adversarial branch.
pub const GENERATOR_STEPS: usize = 2;

/// Supplies training batches to the control thread.
pub trait BatchSource {
    type Batch;

    /// Next batch, or `Ok(None)` once the input is exhausted.
    fn next_batch(&mut self) -> Result<Option<Self::Batch>>;

    /// Stop and join any background producers. Must be safe to call twice.
    fn shutdown(&mut self) -> Result<()>;
}

impl BatchSource for Prefetcher {
    type Batch = CaptionBatch;

    fn next_batch(&mut self) -> Result<Option<CaptionBatch>> {
        Prefetcher::next_batch(self)
    }

    fn shutdown(&mut self) -> Result<()> {
        Prefetcher::shutdown(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// One NLL step on the generator.
    Pretrain,
    /// One discriminator step, then `GENERATOR_STEPS` generator steps.
    Adversarial,
}

/// Chooses the branch from the latest NLL loss alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub nll_threshold: f64,
}

impl ThresholdPolicy {
    pub fn new(nll_threshold: f64) -> Self {
        Self { nll_threshold }
    }

    pub fn branch(&self, nll_loss: f64) -> Branch {
        if nll_loss > self.nll_threshold {
            Branch::Pretrain
        } else {
            Branch::Adversarial
        }
    }
}

/// Most recent value of every tracked loss and accuracy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSnapshot {
    pub nll_loss: f64,
    pub g_loss: f64,
    pub d_loss: f64,
    pub d_acc: f64,
    pub g_acc: f64,
}

impl LossSnapshot {
    pub fn initial() -> Self {
        Self {
            nll_loss: f64::INFINITY,
            g_loss: f64::INFINITY,
            d_loss: f64::INFINITY,
            d_acc: 0.0,
            g_acc: 0.0,
        }
    }

    pub fn metrics(&self) -> [(&'static str, MetricValue); 5] {
        [
            ("NLL_loss", self.nll_loss.into()),
            ("g_loss", self.g_loss.into()),
            ("d_loss", self.d_loss.into()),
            ("d_acc", self.d_acc.into()),
            ("g_acc", self.g_acc.into()),
        ]
    }
}

impl Default for LossSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

/// Loop bounds and cadences for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerOptions {
    pub number_of_epochs: usize,
    pub batches_per_epoch: usize,
    /// 0 disables progress lines.
    pub log_every_n_steps: usize,
    /// A checkpoint is written when `counter % checkpoint_every == 1`;
    /// values of 0 or 1 save after every step.
    pub checkpoint_every: usize,
    pub nll_threshold: f64,
}

impl TrainerOptions {
    pub fn from_config(config: &TrainingConfig, number_of_epochs: usize, log_every_n_steps: usize) -> Self {
        Self {
            number_of_epochs,
            batches_per_epoch: config.batches_per_epoch(),
            log_every_n_steps,
            checkpoint_every: config.checkpoint_every,
            nll_threshold: config.nll_threshold,
        }
    }

    fn validation_interval(&self) -> usize {
        (self.batches_per_epoch / 10).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Every epoch of the loop bound ran to its last batch.
    Completed,
    /// The batch source ran dry first.
    EpochLimitReached,
}

/// Held-out image whose captions are appended to the validation log.
pub struct CaptionSampler<I> {
    pub log: ValidationLog,
    pub vocab: Vocabulary,
    pub image: I,
}

/// Alternating adversarial training loop with checkpointing and validation.
pub struct Trainer<M: AdversarialModel, S> {
    model: M,
    source: S,
    store: CheckpointStore,
    sampler: CaptionSampler<M::Image>,
    options: TrainerOptions,
    policy: ThresholdPolicy,
    losses: LossSnapshot,
    counter: usize,
}

impl<M, S> Trainer<M, S>
where
    M: AdversarialModel + Snapshot,
    S: BatchSource<Batch = M::Batch>,
{
    pub fn new(
        model: M,
        source: S,
        store: CheckpointStore,
        sampler: CaptionSampler<M::Image>,
        options: TrainerOptions,
    ) -> Self {
        let policy = ThresholdPolicy::new(options.nll_threshold);
        Self {
            model,
            source,
            store,
            sampler,
            options,
            policy,
            losses: LossSnapshot::initial(),
            counter: 0,
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn losses(&self) -> LossSnapshot {
        self.losses
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Restore parameters and the step counter from the latest checkpoint.
    pub fn resume(&mut self) -> Result<Option<CheckpointId>> {
        match self.store.latest()? {
            Some(id) => {
                self.counter = self.store.load(&mut self.model, &id)?;
                tracing::info!("restored {} at step {}", id.path.display(), self.counter);
                Ok(Some(id))
            }
            None => {
                self.counter = 0;
                tracing::info!(
                    "no checkpoint in {}, starting from scratch",
                    self.store.dir().display()
                );
                Ok(None)
            }
        }
    }

    /// Train until the loop bound or input exhaustion. Input workers are
    /// stopped and joined on every path.
    pub fn run(&mut self) -> Result<TrainOutcome> {
        let result = self.train_loop();
        let shutdown = self.source.shutdown();

        match (result, shutdown) {
            (Ok(outcome), Ok(())) => {
                match outcome {
                    TrainOutcome::Completed => tracing::info!(
                        "Finished training: {} epochs done at step {}",
                        self.options.number_of_epochs,
                        self.counter
                    ),
                    TrainOutcome::EpochLimitReached => {
                        tracing::info!("Finished training: epoch limit reached")
                    }
                }
                Ok(outcome)
            }
            (Ok(_), Err(err)) => {
                tracing::error!("Training stopped at step {}: {err}", self.counter);
                Err(err)
            }
            (Err(err), shutdown) => {
                if let Err(shutdown_err) = shutdown {
                    tracing::warn!("input shutdown failed: {shutdown_err}");
                }
                tracing::error!("Training failed at step {}: {err}", self.counter);
                Err(err)
            }
        }
    }

    fn train_loop(&mut self) -> Result<TrainOutcome> {
        self.sample(&SampleHeader::Initial)?;

        let start = Instant::now();
        let n_epochs = self.options.number_of_epochs;
        let n_batches = self.options.batches_per_epoch;

        for epoch in 0..n_epochs {
            for batch_idx in 0..n_batches {
                let Some(batch) = self.source.next_batch()? else {
                    return Ok(TrainOutcome::EpochLimitReached);
                };
                self.counter += 1;
                self.step(&batch)?;

                let every = self.options.log_every_n_steps;
                if every > 0 && self.counter % every == 0 {
                    tracing::info!(
                        "{}",
                        format_progress(
                            epoch,
                            batch_idx,
                            n_batches,
                            &self.losses.metrics(),
                            start.elapsed().as_secs_f64(),
                            Some(self.counter),
                        )
                    );
                }

                let last_batch = batch_idx + 1 == n_batches;
                if self.checkpoint_due(last_batch && epoch + 1 == n_epochs) {
                    let id = self.store.save(&self.model, self.counter)?;
                    tracing::info!("saved checkpoint {}", id.name());
                }

                if (batch_idx + 1) % self.options.validation_interval() == 0 || last_batch {
                    self.sample(&SampleHeader::Progress {
                        counter: self.counter,
                        epoch,
                        batch: batch_idx,
                        n_batches,
                    })?;
                }
            }
        }
        Ok(TrainOutcome::Completed)
    }

    /// Run one iteration of the branch the policy picks.
    fn step(&mut self, batch: &M::Batch) -> Result<Branch> {
        let branch = self.policy.branch(self.losses.nll_loss);
        match branch {
            Branch::Pretrain => {
                let report = self.model.train_step(Objective::Nll, batch, self.counter)?;
                self.losses = LossSnapshot {
                    nll_loss: report.nll_loss,
                    ..self.losses
                };
            }
            Branch::Adversarial => {
                let report = self
                    .model
                    .train_step(Objective::Discriminator, batch, self.counter)?;
                self.losses = LossSnapshot {
                    d_loss: report.d_loss,
                    d_acc: report.accuracy,
                    ..self.losses
                };
                for _ in 0..GENERATOR_STEPS {
                    let report =
                        self.model
                            .train_step(Objective::GeneratorAdversarial, batch, self.counter)?;
                    self.losses = LossSnapshot {
                        nll_loss: report.nll_loss,
                        g_loss: report.g_loss,
                        g_acc: report.accuracy,
                        ..self.losses
                    };
                }
            }
        }
        Ok(branch)
    }

    fn checkpoint_due(&self, final_batch: bool) -> bool {
        let every = self.options.checkpoint_every;
        final_batch || every <= 1 || self.counter % every == 1
    }

    fn sample(&mut self, header: &SampleHeader) -> Result<()> {
        let captions = self.model.generate(&self.sampler.image)?;
        self.sampler
            .log
            .append(header, &captions, &self.sampler.vocab)
    }
}
