/// Artifact verification after a zero exit.
///
/// An interpreter can exit cleanly while the terminal binding held an
/// empty or void shape, so the artifact itself is checked.
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use super::{ExecutionFailure, ExecutionResult};

pub async fn verify(artifact_path: &Path, min_bytes: u64) -> ExecutionResult {
    let metadata = match tokio::fs::metadata(artifact_path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            warn!("Artifact path {} is not a regular file", artifact_path.display());
            return ExecutionResult::Failed(ExecutionFailure::ArtifactMissing);
        }
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!("Cannot stat artifact {}: {e}", artifact_path.display());
            }
            return ExecutionResult::Failed(ExecutionFailure::ArtifactMissing);
        }
    };

    let size = metadata.len();
    if size < min_bytes {
        warn!("Artifact is only {size} bytes (minimum {min_bytes})");
        return ExecutionResult::Failed(ExecutionFailure::ArtifactTooSmall {
            size,
            min: min_bytes,
        });
    }

    debug!("Artifact verified: {size} bytes");
    ExecutionResult::Success(artifact_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = verify(&dir.path().join("nope.stl"), 100).await;
        assert_eq!(
            result,
            ExecutionResult::Failed(ExecutionFailure::ArtifactMissing)
        );
    }

    #[tokio::test]
    async fn test_directory_is_not_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = verify(dir.path(), 0).await;
        assert_eq!(
            result,
            ExecutionResult::Failed(ExecutionFailure::ArtifactMissing)
        );
    }

    #[tokio::test]
    async fn test_empty_artifact_is_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.stl");
        std::fs::write(&path, b"").unwrap();

        let result = verify(&path, 100).await;
        assert_eq!(
            result,
            ExecutionResult::Failed(ExecutionFailure::ArtifactTooSmall { size: 0, min: 100 })
        );
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.stl");
        std::fs::write(&path, vec![b'x'; 100]).unwrap();

        assert_eq!(verify(&path, 100).await, ExecutionResult::Success(path.clone()));
        assert_eq!(
            verify(&path, 101).await,
            ExecutionResult::Failed(ExecutionFailure::ArtifactTooSmall { size: 100, min: 101 })
        );
    }
}
