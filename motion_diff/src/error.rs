//! Pass-level error taxonomy.

use crate::core_modules::frame::DecodeError;
use crate::fabric::FabricError;
use crate::fabric::transport::TransferError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PassError {
    /// No frame matched the naming convention. Every endpoint observes this.
    #[error("no frames found in {}", dir.display())]
    EmptyInput { dir: PathBuf },

    /// Recovered locally by skipping the affected pair; only surfaces when a caller
    /// asks for a single frame pair.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another endpoint failed; this one aborts with it.
    #[error("endpoint {rank} aborted: {reason}")]
    PeerAborted { rank: usize, reason: String },

    /// The collector called the pass off after the barrier.
    #[error("pass aborted: {reason}")]
    Aborted { reason: String },

    #[error("frame extraction failed: {0}")]
    Extraction(String),

    #[error("video assembly failed: {0}")]
    Assembly(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("diff worker failed: {0}")]
    Worker(String),
}

impl PassError {
    pub fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }
}

impl From<FabricError> for PassError {
    fn from(e: FabricError) -> Self {
        Self::Transfer(TransferError::Fabric(e))
    }
}

/// Result alias for pass operations.
pub type Result<T> = std::result::Result<T, PassError>;
