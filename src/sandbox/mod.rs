//! Execution sandbox for admitted CAD scripts.
//!
//! The static validator is the first layer; this module is the second,
//! independent one. It knows nothing about script semantics:
//!
//! 1. Each job gets a fresh token that names its script and artifact,
//!    so no path ever comes from user or model text.
//! 2. The interpreter runs as a separate process with no stdin, captured
//!    output and a hard wall-clock deadline. Overrunning jobs are killed.
//! 3. Exit status alone is not trusted: the artifact must exist and be
//!    larger than a minimum size.
//! 4. Old scratch files are swept in the background.

pub mod executor;
pub mod sweeper;
pub mod verify;

use std::path::PathBuf;

pub use executor::Executor;

/// Outcome of running one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success(PathBuf),
    Failed(ExecutionFailure),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Non-zero exit; detail is the captured stderr (or stdout).
    ProcessFailed(String),
    ArtifactMissing,
    ArtifactTooSmall { size: u64, min: u64 },
}

/// Failures that prevent a job from running at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("{0}")]
    Configuration(String),
    #[error("failed to start CAD interpreter: {0}")]
    Spawn(String),
    #[error("{0}")]
    Io(String),
}
