use crate::error::{Result, TrainError};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One line of a training shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub image_id: u64,
    pub features: Vec<f32>,
    /// Word ids including the start and end ids.
    pub caption: Vec<usize>,
}

/// A padded batch in host memory, ready to be moved onto a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionBatch {
    pub batch_size: usize,
    pub feature_dim: usize,
    pub seq_len: usize,
    /// `[batch_size, feature_dim]`, row-major.
    pub features: Vec<f32>,
    /// `[batch_size, seq_len]`: caption without its last id.
    pub input_seqs: Vec<i64>,
    /// `[batch_size, seq_len]`: caption without its first id.
    pub target_seqs: Vec<i64>,
    /// `[batch_size, seq_len]`: 1 on real targets, 0 on padding.
    pub mask: Vec<f32>,
}

impl CaptionBatch {
    /// Pad `records` to the longest caption in the batch (pad id 0).
    pub fn from_records(records: &[CaptionRecord]) -> Result<Self> {
        let Some(first) = records.first() else {
            return Err(TrainError::Config("cannot build an empty batch".to_string()));
        };
        let feature_dim = first.features.len();
        let batch_size = records.len();
        let seq_len = records
            .iter()
            .map(|record| record.caption.len().saturating_sub(1))
            .max()
            .unwrap_or(0);
        if seq_len == 0 {
            return Err(TrainError::Config(
                "batch contains no caption with at least two ids".to_string(),
            ));
        }

        let mut features = Vec::with_capacity(batch_size * feature_dim);
        let mut input_seqs = vec![0i64; batch_size * seq_len];
        let mut target_seqs = vec![0i64; batch_size * seq_len];
        let mut mask = vec![0.0f32; batch_size * seq_len];

        for (row, record) in records.iter().enumerate() {
            if record.features.len() != feature_dim {
                return Err(TrainError::Config(format!(
                    "image {} has {} features, expected {feature_dim}",
                    record.image_id,
                    record.features.len()
                )));
            }
            features.extend_from_slice(&record.features);

            let offset = row * seq_len;
            for (t, pair) in record.caption.windows(2).enumerate() {
                input_seqs[offset + t] = pair[0] as i64;
                target_seqs[offset + t] = pair[1] as i64;
                mask[offset + t] = 1.0;
            }
        }

        Ok(Self {
            batch_size,
            feature_dim,
            seq_len,
            features,
            input_seqs,
            target_seqs,
            mask,
        })
    }

    /// Features of the first image in the batch.
    pub fn first_features(&self) -> &[f32] {
        &self.features[..self.feature_dim]
    }
}

/// Expand a glob into the sorted list of shard files it matches.
pub fn resolve_shards(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|err| TrainError::Config(format!("invalid input file pattern {pattern}: {err}")))?;
    let mut shards = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => shards.push(path),
            Ok(_) => {}
            Err(err) => tracing::warn!("skipping unreadable path: {err}"),
        }
    }
    if shards.is_empty() {
        return Err(TrainError::Config(format!(
            "found no input files matching {pattern}"
        )));
    }
    shards.sort();
    tracing::info!("prefetching values from {} files matching {pattern}", shards.len());
    Ok(shards)
}

/// Read every record of a JSON-lines shard.
///
/// Blank lines are ignored; captions too short to form one training pair
/// are skipped with a warning.
pub fn read_shard(path: &Path) -> Result<Vec<CaptionRecord>> {
    let file = File::open(path).map_err(|err| TrainError::io(path, err))?;
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| TrainError::io(path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CaptionRecord =
            serde_json::from_str(&line).map_err(|err| TrainError::Input {
                path: path.to_path_buf(),
                message: format!("line {}: {err}", line_no + 1),
            })?;
        if record.caption.len() < 2 {
            tracing::warn!(
                "skipping image {} in {}: caption has {} ids",
                record.image_id,
                path.display(),
                record.caption.len()
            );
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

/// Load a single feature vector stored as a JSON array of floats.
pub fn load_features(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path).map_err(|err| TrainError::io(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| TrainError::Input {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Settings for the background input workers.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub batch_size: usize,
    pub num_threads: usize,
    /// Bound of the queue between workers and the trainer, in batches.
    pub queue_capacity: usize,
    /// Passes each worker makes over its shards; `None` never stops.
    pub input_epochs: Option<usize>,
    pub seed: u64,
}

const SEND_RETRY: Duration = Duration::from_millis(20);

/// Fixed pool of reader threads feeding a bounded batch queue.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<CaptionBatch>>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Prefetcher {
    /// Spawn the workers. Worker `i` reads shards `i, i + n, i + 2n, ...`.
    pub fn start(shards: Vec<PathBuf>, config: PrefetchConfig) -> Result<Self> {
        if shards.is_empty() {
            return Err(TrainError::Config("no input shards to read".to_string()));
        }
        if config.batch_size == 0 || config.num_threads == 0 || config.queue_capacity == 0 {
            return Err(TrainError::Config(format!(
                "invalid prefetch settings: {config:?}"
            )));
        }

        let (sender, receiver) = sync_channel(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let num_threads = config.num_threads.min(shards.len());
        let mut workers = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let owned = shards
                .iter()
                .skip(worker_id)
                .step_by(num_threads)
                .cloned()
                .collect::<Vec<_>>();
            let worker = ShardWorker {
                shards: owned,
                sender: sender.clone(),
                stop: Arc::clone(&stop),
                batch_size: config.batch_size,
                input_epochs: config.input_epochs,
                rng: StdRng::seed_from_u64(config.seed.wrapping_add(worker_id as u64)),
                pending: Vec::with_capacity(config.batch_size),
            };
            let handle = thread::Builder::new()
                .name(format!("input-reader-{worker_id}"))
                .spawn(move || worker.run())
                .map_err(|err| TrainError::Worker(format!("failed to spawn reader: {err}")))?;
            workers.push(handle);
        }

        Ok(Self {
            receiver: Some(receiver),
            workers,
            stop,
        })
    }

    /// Block for the next batch; `Ok(None)` once every worker has finished.
    pub fn next_batch(&mut self) -> Result<Option<CaptionBatch>> {
        let Some(receiver) = &self.receiver else {
            return Ok(None);
        };
        match receiver.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(None),
        }
    }

    /// Signal every worker to stop, unblock them and join them.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.receiver.take();
        let mut failed = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(TrainError::Worker(format!("{failed} input reader(s) panicked")));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!("{err}");
        }
    }
}

struct ShardWorker {
    shards: Vec<PathBuf>,
    sender: SyncSender<Result<CaptionBatch>>,
    stop: Arc<AtomicBool>,
    batch_size: usize,
    input_epochs: Option<usize>,
    rng: StdRng,
    /// Records waiting for a full batch. Carried from one pass to the next.
    pending: Vec<CaptionRecord>,
}

impl ShardWorker {
    fn run(mut self) {
        let mut pass = 0;
        while self.input_epochs.map_or(true, |limit| pass < limit) {
            match self.read_pass() {
                None => return,
                Some(0) => {
                    tracing::warn!("input reader found no usable records in {:?}", self.shards);
                    return;
                }
                Some(_) => pass += 1,
            }
        }
        // A trailing partial batch is dropped.
    }

    /// One pass over the owned shards. Returns the number of records read,
    /// or `None` when the worker must exit.
    fn read_pass(&mut self) -> Option<usize> {
        let mut order = self.shards.clone();
        order.shuffle(&mut self.rng);

        let mut read = 0;
        for shard in order {
            if self.stopped() {
                return None;
            }
            let mut records = match read_shard(&shard) {
                Ok(records) => records,
                Err(err) => {
                    self.send(Err(err));
                    return None;
                }
            };
            records.shuffle(&mut self.rng);
            read += records.len();

            for record in records {
                self.pending.push(record);
                if self.pending.len() == self.batch_size {
                    let batch = CaptionBatch::from_records(&self.pending);
                    self.pending.clear();
                    if !self.send(batch) {
                        return None;
                    }
                }
            }
        }
        Some(read)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Blocking send that still notices the stop flag. Returns false when
    /// the batch could not be delivered or was an error.
    fn send(&self, item: Result<CaptionBatch>) -> bool {
        let is_err = item.is_err();
        let mut item = item;
        loop {
            if self.stopped() {
                return false;
            }
            match self.sender.try_send(item) {
                Ok(()) => return !is_err,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    thread::sleep(SEND_RETRY);
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}
