use std::path::PathBuf;

use thiserror::Error;

use crate::container::ContainerError;

/// Errors surfaced by an ensemble run.
///
/// Everything here is fatal to the run except where the orchestrator
/// explicitly recovers (auxiliary file copies).
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Bad configuration or an impossible request (e.g. too few modes)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Member output directory exists and `force` was not set
    #[error("output directory already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Read, write, copy or checksum failure on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Container could not be decoded or encoded
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The target value is unchanged between input and output
    #[error(
        "Perturbation failed: input file {} and output file {} are the same",
        input.display(),
        output.display()
    )]
    VerificationFailure { input: PathBuf, output: PathBuf },
}

impl EnsembleError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EnsembleError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = EnsembleError> = std::result::Result<T, E>;
