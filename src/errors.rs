//! Error taxonomy for the supervisor, its workers and artifact staging.
use std::path::PathBuf;

/// Failures reported by a worker backend's `start`/`stop`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The external executable could not be launched, or died before becoming live.
    #[error("failed to spawn worker from {path}: {reason}")]
    Spawn { path: PathBuf, reason: String },

    /// The artifact is unreadable or not a loadable code unit.
    #[error("failed to load artifact {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The artifact loaded but does not export the expected entry point.
    #[error("artifact {path} does not satisfy the entry point contract: {reason}")]
    Contract { path: PathBuf, reason: String },

    #[error("failed to stop worker: {0}")]
    Stop(String),
}

/// Failures while persisting an uploaded or fetched artifact.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read artifact stream: {0}")]
    Stream(String),

    #[error("artifact source error: {0}")]
    Source(String),
}

/// Why a reload request did not result in a new active worker.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("no pending artifact to adopt")]
    NoPendingArtifact,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("supervisor is not running")]
    ChannelClosed,
}
