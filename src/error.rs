use std::path::PathBuf;

/// Errors surfaced by the training library.
///
/// Running out of input is not represented here: batch sources report it as
/// `Ok(None)` and the trainer treats it as a normal way to finish.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("malformed input in {}: {message}", path.display())]
    Input { path: PathBuf, message: String },
    #[error("input worker failed: {0}")]
    Worker(String),
    #[error("model error: {0}")]
    Model(String),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
