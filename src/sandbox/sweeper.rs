/// Retention sweeper for the shared scratch directory.
///
/// Best-effort housekeeping: deletes files whose last modification is
/// older than the retention window. Nothing here can fail a request.
/// Files that vanish between listing and deletion (another sweep, or a
/// job cleaning up) are skipped silently.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Starts a detached sweep. The handle may be dropped; the task keeps running.
pub fn spawn_sweep(dir: PathBuf, max_age: Duration) -> JoinHandle<SweepReport> {
    tokio::spawn(async move { sweep(&dir, max_age).await })
}

pub async fn sweep(dir: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    debug!("Sweeping {} (max age {}s)", dir.display(), max_age.as_secs());

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list {} for cleanup: {e}", dir.display());
            return report;
        }
    };

    let now = SystemTime::now();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Cleanup listing of {} interrupted: {e}", dir.display());
                break;
            }
        };
        let path = entry.path();

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Cannot stat {}: {e}", path.display());
                report.failed += 1;
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let Ok(modified) = metadata.modified() else {
            continue;
        };
        // Modification times in the future count as fresh
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= max_age {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed stale scratch file {}", path.display());
                report.removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to delete old file {}: {e}", path.display());
                report.failed += 1;
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        info!(
            "Cleanup of {}: {} removed, {} failed",
            dir.display(),
            report.removed,
            report.failed
        );
    }
    report
}
