/// Execution orchestrator: runs an admitted script in the CAD interpreter.
///
/// Every job writes `{token}.py` and expects `{token}.stl` in the output
/// directory. The export call is appended here, never taken from the
/// generated text, so each run has exactly one export site.
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CadConfig;
use crate::gateway::NormalizedSource;

use super::{sweeper, verify, ExecutionFailure, ExecutionResult, SandboxError};

/// The single export operation the epilogue is allowed to call.
const SANCTIONED_EXPORT: &str = "exportStl";

const SCRIPT_EXTENSION: &str = "py";
const ARTIFACT_EXTENSION: &str = "stl";

/// Captured output kept per stream; the rest is drained and dropped.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for output pipes to close after the process exits.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// One execution: a unique token and the two paths it owns.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub job_id: String,
    pub script_path: PathBuf,
    pub artifact_path: PathBuf,
    pub deadline: Duration,
}

impl ExecutionJob {
    pub fn new(output_dir: &Path, deadline: Duration) -> Self {
        let job_id = uuid::Uuid::new_v4().to_string();
        Self {
            script_path: output_dir.join(format!("{job_id}.{SCRIPT_EXTENSION}")),
            artifact_path: output_dir.join(format!("{job_id}.{ARTIFACT_EXTENSION}")),
            job_id,
            deadline,
        }
    }
}

pub struct Executor {
    executable: Option<PathBuf>,
    output_dir: PathBuf,
    deadline: Duration,
    min_artifact_bytes: u64,
    retention: Duration,
}

impl Executor {
    pub fn new(config: &CadConfig) -> Self {
        // The interpreter may change directory, so the epilogue needs an absolute path
        let output_dir = std::path::absolute(&config.output_dir)
            .unwrap_or_else(|_| config.output_dir.clone());
        Self {
            executable: config.executable_path(),
            output_dir,
            deadline: config.timeout(),
            min_artifact_bytes: config.min_artifact_bytes,
            retention: config.retention(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Resolves the interpreter, failing before any job state exists.
    pub async fn locate_executable(&self) -> Result<PathBuf, SandboxError> {
        let Some(path) = &self.executable else {
            return Err(SandboxError::Configuration("<unset>".to_string()));
        };
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() && is_executable(&m) => Ok(path.clone()),
            Ok(m) if m.is_file() => {
                error!("CAD executable at {} is not executable", path.display());
                Err(SandboxError::Configuration(executable_name(path)))
            }
            Ok(_) | Err(_) => {
                error!("CAD executable not found at {}", path.display());
                Err(SandboxError::Configuration(executable_name(path)))
            }
        }
    }

    /// Runs an admitted script to completion, timeout, or failure.
    pub async fn execute(&self, source: &NormalizedSource) -> Result<ExecutionResult, SandboxError> {
        let executable = self.locate_executable().await?;

        // Housekeeping runs alongside the job and is never awaited
        drop(sweeper::spawn_sweep(self.output_dir.clone(), self.retention));

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| SandboxError::Io(format!("Cannot create output directory: {e}")))?;

        let job = ExecutionJob::new(&self.output_dir, self.deadline);
        let script = compose_script(source, &job.artifact_path);
        tokio::fs::write(&job.script_path, script)
            .await
            .map_err(|e| SandboxError::Io(format!("Cannot write job script: {e}")))?;

        info!("Executing CAD job {} ({}s deadline)", job.job_id, job.deadline.as_secs());
        self.run_job(&executable, &job).await
    }

    async fn run_job(
        &self,
        executable: &Path,
        job: &ExecutionJob,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let mut command = Command::new(executable);
        command
            .arg(&job.script_path)
            .current_dir(&self.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The interpreter leads a fresh process group holding everything it starts
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        // Drain both pipes while waiting, or a chatty interpreter blocks on a full pipe
        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        let status = match tokio::time::timeout(job.deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                abort(stdout);
                abort(stderr);
                return Err(SandboxError::Io(format!("Waiting for interpreter failed: {e}")));
            }
            Err(_elapsed) => {
                // The group goes first, while the leader is unreaped and its pid still names the group
                kill_process_group(&child, &job.job_id);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill timed-out job {}: {e}", job.job_id);
                }
                abort(stdout);
                abort(stderr);
                warn!(
                    "Job {} exceeded its {}s deadline, interpreter killed",
                    job.job_id,
                    job.deadline.as_secs()
                );
                return Ok(ExecutionResult::TimedOut);
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;
        debug!(
            "Job {} exited with {status} after {}ms",
            job.job_id,
            started.elapsed().as_millis()
        );

        if !status.success() {
            let detail = self.scrub_paths(&failure_detail(&stderr, &stdout, status));
            error!("CAD execution failed for job {} ({status}): {detail}", job.job_id);
            return Ok(ExecutionResult::Failed(ExecutionFailure::ProcessFailed(
                detail,
            )));
        }

        let result = verify::verify(&job.artifact_path, self.min_artifact_bytes).await;
        if let ExecutionResult::Success(_) = result {
            info!("Job {} produced {}", job.job_id, job.artifact_path.display());
        }
        Ok(result)
    }

    /// Strips the output directory from diagnostics so only job-local
    /// file names remain.
    fn scrub_paths(&self, text: &str) -> String {
        let dir = self.output_dir.display().to_string();
        let forward = dir.replace('\\', "/");
        text.replace(&format!("{dir}{MAIN_SEPARATOR}"), "")
            .replace(&format!("{forward}/"), "")
            .replace(&dir, "<output>")
    }
}

fn executable_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<invalid path>".to_string())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// SIGKILLs every process in the interpreter's group, so helpers it
/// forked die with it.
#[cfg(unix)]
fn kill_process_group(child: &Child, job_id: &str) {
    let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory of ours
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        warn!(
            "Failed to kill process group {pgid} of job {job_id}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child, _job_id: &str) {}

/// Appends the trusted export epilogue to an admitted script.
pub fn compose_script(source: &NormalizedSource, artifact_path: &Path) -> String {
    let binding = source.binding();
    let target = python_string(&artifact_path.to_string_lossy().replace('\\', "/"));
    format!(
        "{}\n\nif '{binding}' in locals() and {binding} is not None:\n    {binding}.{SANCTIONED_EXPORT}({target})\n",
        source.as_str()
    )
}

fn python_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn failure_detail(stderr: &str, stdout: &str, status: ExitStatus) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("interpreter exited with {status} and no output")
}

fn capture<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild still holds the pipe open
            handle.abort();
            String::new()
        }
    }
}

fn abort(handle: Option<JoinHandle<String>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}
