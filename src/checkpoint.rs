use crate::error::{Result, TrainError};
use std::fs;
use std::path::{Path, PathBuf};

/// Something whose full parameter state can be written to and restored from a file.
pub trait Snapshot {
    fn save_to(&self, path: &Path) -> Result<()>;
    fn load_from(&mut self, path: &Path) -> Result<()>;
}

/// A checkpoint file and the step counter embedded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointId {
    pub step: usize,
    pub path: PathBuf,
}

impl CheckpointId {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Extract the last maximal run of ASCII digits in `name`.
pub fn parse_step(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let end = bytes.iter().rposition(u8::is_ascii_digit)? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |idx| idx + 1);
    name[start..end].parse().ok()
}

/// Directory of step-keyed model snapshots with bounded retention.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    prefix: String,
    extension: String,
    max_to_keep: usize,
}

impl CheckpointStore {
    /// Files are named `<prefix>-<step>.<extension>`; `dir` is created if missing.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
        max_to_keep: usize,
    ) -> Result<Self> {
        let dir = dir.into();
        if max_to_keep == 0 {
            return Err(TrainError::Config(
                "max_checkpoints_to_keep must be at least 1".to_string(),
            ));
        }
        fs::create_dir_all(&dir).map_err(|err| TrainError::io(&dir, err))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            extension: extension.into(),
            max_to_keep,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir
            .join(format!("{}-{step}.{}", self.prefix, self.extension))
    }

    /// Hidden file the snapshot is written to before it is renamed into place.
    /// The extension is kept so recorders that force it write the same path.
    fn partial_path_for(&self, step: usize) -> PathBuf {
        self.dir
            .join(format!(".{}-{step}.partial.{}", self.prefix, self.extension))
    }

    /// Write a new checkpoint for `step`, then prune old ones.
    ///
    /// The snapshot only appears under its final name once it was written in
    /// full, and pruning only runs after that, so a failed save leaves the
    /// earlier checkpoints as they were.
    pub fn save<S: Snapshot + ?Sized>(&self, snapshot: &S, step: usize) -> Result<CheckpointId> {
        let partial = self.partial_path_for(step);
        let path = self.path_for(step);
        if let Err(err) = self.write_partial(snapshot, &partial) {
            if partial.exists() {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    tracing::warn!("failed to remove {}: {cleanup}", partial.display());
                }
            }
            return Err(err);
        }
        fs::rename(&partial, &path).map_err(|err| TrainError::io(&path, err))?;
        tracing::debug!("saved checkpoint {}", path.display());
        self.prune()?;
        Ok(CheckpointId { step, path })
    }

    fn write_partial<S: Snapshot + ?Sized>(&self, snapshot: &S, partial: &Path) -> Result<()> {
        snapshot.save_to(partial)?;
        if !partial.is_file() {
            return Err(TrainError::Checkpoint(format!(
                "snapshot did not produce {}",
                partial.display()
            )));
        }
        Ok(())
    }

    /// All checkpoints in the directory, ascending by step (ties by name).
    pub fn list(&self) -> Result<Vec<CheckpointId>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| TrainError::io(&self.dir, err))?;
        let name_prefix = format!("{}-", self.prefix);
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| TrainError::io(&self.dir, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let matches_ext = path
                .extension()
                .map(|ext| ext.to_string_lossy() == self.extension.as_str())
                .unwrap_or(false);
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if !matches_ext || !stem.starts_with(&name_prefix) {
                continue;
            }
            if let Some(step) = parse_step(&stem) {
                ids.push(CheckpointId { step, path });
            }
        }
        ids.sort_by(|a, b| a.step.cmp(&b.step).then_with(|| a.path.cmp(&b.path)));
        Ok(ids)
    }

    /// The checkpoint with the numerically largest step, if any.
    pub fn latest(&self) -> Result<Option<CheckpointId>> {
        Ok(self.list()?.pop())
    }

    /// Restore `snapshot` from `id` and return the step it was saved at.
    pub fn load<S: Snapshot + ?Sized>(&self, snapshot: &mut S, id: &CheckpointId) -> Result<usize> {
        snapshot.load_from(&id.path)?;
        Ok(id.step)
    }

    /// Delete all but the `max_to_keep` most recent checkpoints.
    pub fn prune(&self) -> Result<Vec<CheckpointId>> {
        let ids = self.list()?;
        let excess = ids.len().saturating_sub(self.max_to_keep);
        let removed = ids.into_iter().take(excess).collect::<Vec<_>>();
        for id in &removed {
            fs::remove_file(&id.path).map_err(|err| TrainError::io(&id.path, err))?;
            tracing::debug!("removed old checkpoint {}", id.path.display());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Weights {
        values: Vec<f32>,
    }

    impl Snapshot for Weights {
        fn save_to(&self, path: &Path) -> Result<()> {
            let json = serde_json::to_string(self).unwrap();
            fs::write(path, json).map_err(|err| TrainError::io(path, err))
        }

        fn load_from(&mut self, path: &Path) -> Result<()> {
            let json = fs::read_to_string(path).map_err(|err| TrainError::io(path, err))?;
            *self = serde_json::from_str(&json).unwrap();
            Ok(())
        }
    }

    struct FailingSnapshot;

    impl Snapshot for FailingSnapshot {
        fn save_to(&self, path: &Path) -> Result<()> {
            fs::write(path, "trunc").map_err(|err| TrainError::io(path, err))?;
            Err(TrainError::Checkpoint(format!("disk full at {}", path.display())))
        }

        fn load_from(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn store(dir: &Path, keep: usize) -> CheckpointStore {
        CheckpointStore::new(dir, "im2txt", "mpk", keep).unwrap()
    }

    #[test]
    fn test_parse_step_takes_last_digit_run() {
        assert_eq!(parse_step("im2txt-500"), Some(500));
        assert_eq!(parse_step("im2txt-500.mpk"), Some(500));
        assert_eq!(parse_step("model.ckpt-1234"), Some(1234));
        assert_eq!(parse_step("12"), Some(12));
        assert_eq!(parse_step("im-txt"), None);
    }

    #[test]
    fn test_round_trip_restores_step_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 5);
        let saved = Weights {
            values: vec![0.5, -1.25, 3.0],
        };
        store.save(&saved, 37).unwrap();

        let latest = store.latest().unwrap().expect("checkpoint present");
        let mut restored = Weights::default();
        let step = store.load(&mut restored, &latest).unwrap();
        assert_eq!(step, 37);
        assert_eq!(restored, saved);
        assert_eq!(latest.name(), "im2txt-37.mpk");
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let weights = Weights::default();
        for step in [1, 501, 1001, 1501, 2001, 2501, 3001] {
            store.save(&weights, step).unwrap();
        }
        let steps = store.list().unwrap().iter().map(|id| id.step).collect::<Vec<_>>();
        assert_eq!(steps, vec![2001, 2501, 3001]);
    }

    #[test]
    fn test_latest_uses_numeric_step_not_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 10);
        let weights = Weights::default();
        store.save(&weights, 1000).unwrap();
        store.save(&weights, 999).unwrap();
        store.save(&weights, 20).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().step, 1000);
    }

    #[test]
    fn test_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 10);
        fs::write(dir.path().join("valid.txt"), "initial caption").unwrap();
        fs::write(dir.path().join("other-99999.mpk"), "x").unwrap();
        fs::write(dir.path().join("im2txt-77.json"), "x").unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_failed_save_keeps_previous_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1);
        store.save(&Weights::default(), 1).unwrap();
        assert!(store.save(&FailingSnapshot, 501).is_err());
        let steps = store.list().unwrap().iter().map(|id| id.step).collect::<Vec<_>>();
        assert_eq!(steps, vec![1]);
    }

    #[test]
    fn test_truncated_write_never_becomes_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 5);
        let saved = Weights {
            values: vec![1.0, 2.0],
        };
        store.save(&saved, 1).unwrap();
        assert!(store.save(&FailingSnapshot, 501).is_err());

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.step, 1);
        let mut restored = Weights::default();
        store.load(&mut restored, &latest).unwrap();
        assert_eq!(restored, saved);

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointStore::new(dir.path(), "im2txt", "mpk", 0).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }
}
