use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, aligning or transforming a batch of subjects.
#[derive(Debug, Error)]
pub enum AlignError {
    /// An expected landmark or mesh file does not exist.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A landmark or mesh file could not be parsed.
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// Point counts disagree across the batch.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Too few, coincident, collinear or coplanar points for the requested fit.
    #[error("degenerate configuration: {0}")]
    DegenerateConfiguration(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AlignError {
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AlignError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Maps an I/O error to `NotFound` when the file is missing.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            AlignError::NotFound(path)
        } else {
            AlignError::Io { path, source }
        }
    }
}

pub type AlignResult<T> = Result<T, AlignError>;
