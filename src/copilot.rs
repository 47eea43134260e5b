//! Copilot flows: natural-language request → LLM → gateway.
//!
//! Everything the generator returns goes through [`Gateway::admit`]; the
//! copilot never executes or returns unvalidated code.

use std::path::Path;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::gateway::error::{ErrorDetail, ErrorResponse};
use crate::gateway::{Admission, Gateway, GatewayError};
use crate::llm::{refine_system_prompt, CodeGenerator, LlmError, MAX_PROMPT_CHARS, SYSTEM_PROMPT};

#[derive(Debug, thiserror::Error)]
pub enum CopilotError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Code generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl CopilotError {
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            CopilotError::Gateway(e) => e.to_response(),
            CopilotError::InvalidRequest(_) => ErrorResponse {
                status: "error",
                http_status: 400,
                code: "ERR_REQUEST",
                error: ErrorDetail {
                    error_type: "request_error",
                    kind: "invalid_request",
                    message: self.to_string(),
                    details: None,
                },
            },
            CopilotError::Llm(e) => ErrorResponse {
                status: "error",
                http_status: 502,
                code: "ERR_LLM",
                error: ErrorDetail {
                    error_type: "llm_error",
                    kind: "generation_failed",
                    message: "Code generation failed".to_string(),
                    details: Some(e.to_string()),
                },
            },
        }
    }
}

/// Component health, as reported by `status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub llm: String,
    pub llm_reachable: bool,
    pub cad_available: bool,
    pub cad_executable: Option<String>,
    pub output_dir_writable: bool,
}

pub struct Copilot {
    generator: Box<dyn CodeGenerator>,
    gateway: Gateway,
}

impl Copilot {
    pub fn new(generator: Box<dyn CodeGenerator>, gateway: Gateway) -> Self {
        Self { generator, gateway }
    }

    /// Generates a new model from a natural-language request.
    pub async fn generate(&self, prompt: &str) -> Result<Admission, CopilotError> {
        let prompt = check_request(prompt)?;
        info!("Generating new model: {}", preview(prompt));

        let candidate = self.generator.generate(SYSTEM_PROMPT, prompt).await?;
        self.admit(&candidate).await
    }

    /// Modifies a previous script according to a new instruction.
    pub async fn refine(
        &self,
        previous_code: &str,
        instruction: &str,
    ) -> Result<Admission, CopilotError> {
        let instruction = check_request(instruction)?;
        if previous_code.trim().is_empty() {
            return Err(CopilotError::InvalidRequest(
                "previous code is empty".to_string(),
            ));
        }
        info!("Refining existing model: {}", preview(instruction));

        let system_prompt = refine_system_prompt(previous_code);
        let candidate = self.generator.generate(&system_prompt, instruction).await?;
        self.admit(&candidate).await
    }

    async fn admit(&self, candidate: &str) -> Result<Admission, CopilotError> {
        self.gateway.admit(candidate).await.map_err(|e| {
            if e.is_validation() {
                warn!("Generated script rejected: {e}");
            } else {
                error!("Generated script did not produce a model: {e}");
            }
            CopilotError::from(e)
        })
    }

    pub async fn status(&self) -> StatusReport {
        let executor = self.gateway.executor();
        let llm_reachable = self.generator.check_health().await;
        let cad_available = executor.locate_executable().await.is_ok();
        let output_dir_writable = probe_writable(executor.output_dir()).await;

        let status = if llm_reachable && cad_available && output_dir_writable {
            "ok"
        } else {
            "error"
        };

        StatusReport {
            status,
            llm: self.generator.description(),
            llm_reachable,
            cad_available,
            cad_executable: executor.executable().map(|p| p.display().to_string()),
            output_dir_writable,
        }
    }
}

fn check_request(text: &str) -> Result<&str, CopilotError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CopilotError::InvalidRequest("request is empty".to_string()));
    }
    let chars = text.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(CopilotError::InvalidRequest(format!(
            "request is {chars} characters (maximum {MAX_PROMPT_CHARS})"
        )));
    }
    Ok(text)
}

fn preview(text: &str) -> String {
    let mut short: String = text.chars().take(50).collect();
    if short.len() < text.len() {
        short.push('…');
    }
    short
}

/// Writes and removes a probe file.
async fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(&probe).await {
                warn!("Cannot remove probe file {}: {e}", probe.display());
            }
            true
        }
        Err(e) => {
            warn!("Output directory {} is not writable: {e}", dir.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CadConfig;
    use crate::gateway::ValidationPolicy;
    use crate::sandbox::Executor;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Replays a canned reply and records what it was asked.
    struct FakeGenerator {
        reply: Result<String, u16>,
        healthy: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeGenerator {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                healthy: true,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeGenerator for Arc<FakeGenerator> {
        async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), prompt.to_string()));
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(LlmError::Api {
                    status: *status,
                    body: "model not found".to_string(),
                }),
            }
        }

        async fn check_health(&self) -> bool {
            self.healthy
        }

        fn description(&self) -> String {
            "fake (test)".to_string()
        }
    }

    fn copilot(
        generator: &Arc<FakeGenerator>,
        output_dir: &Path,
        executable: Option<&Path>,
    ) -> Copilot {
        let cad = CadConfig {
            executable: executable.map(|p| p.display().to_string()),
            timeout_secs: 10,
            output_dir: output_dir.to_path_buf(),
            ..CadConfig::default()
        };
        let gateway = Gateway::new(ValidationPolicy::default(), Executor::new(&cad));
        Copilot::new(Box::new(generator.clone()), gateway)
    }

    #[cfg(unix)]
    fn write_worker(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("FreeCADCmd");
        std::fs::write(&path, "#!/bin/sh\nprintf '%0400d' 0 > \"${1%.py}.stl\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // ── Request checks ───────────────────────────────────

    #[tokio::test]
    async fn test_empty_prompt_never_reaches_generator() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying("final_shape = 1"));
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot.generate("   ").await.unwrap_err();
        assert!(matches!(err, CopilotError::InvalidRequest(_)));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlong_prompt_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying("final_shape = 1"));
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot.generate(&"a".repeat(1001)).await.unwrap_err();
        let response = err.to_response();
        assert_eq!(response.code, "ERR_REQUEST");
        assert_eq!(response.http_status, 400);
    }

    // ── Generation ───────────────────────────────────────

    #[tokio::test]
    async fn test_generated_code_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying(
            "```python\nimport subprocess\nfinal_shape = 1\n```",
        ));
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot.generate("a cube").await.unwrap_err();
        match err {
            CopilotError::Gateway(e) => assert_eq!(e.kind(), "security_violation"),
            other => panic!("unexpected {other:?}"),
        }
        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0].0, SYSTEM_PROMPT);
        assert_eq!(calls[0].1, "a cube");
    }

    #[tokio::test]
    async fn test_llm_failure_maps_to_llm_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator {
            reply: Err(404),
            healthy: false,
            calls: Mutex::new(Vec::new()),
        });
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot.generate("a cube").await.unwrap_err();
        let json = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(json["code"], "ERR_LLM");
        assert_eq!(json["http_status"], 502);
        assert!(json["error"]["details"].as_str().unwrap().contains("404"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_end_to_end() {
        let bin = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let worker = write_worker(bin.path());
        let fake = Arc::new(FakeGenerator::replying(
            "Here you go:\n```python\nimport Part\nfinal_shape = Part.makeBox(20, 20, 20)\n```",
        ));
        let copilot = copilot(&fake, out.path(), Some(&worker));

        let admission = copilot.generate("a 20mm cube").await.unwrap();
        assert!(admission.artifact_path.exists());
        assert_eq!(
            admission.source.as_str(),
            "import Part\nfinal_shape = Part.makeBox(20, 20, 20)"
        );
    }

    // ── Refinement ───────────────────────────────────────

    #[tokio::test]
    async fn test_refine_sends_previous_code_in_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying("final_shape = None"));
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot
            .refine("final_shape = Part.makeBox(1, 1, 1)", "make it taller")
            .await
            .unwrap_err();
        match err {
            CopilotError::Gateway(e) => assert_eq!(e.kind(), "suspicious_null_assignment"),
            other => panic!("unexpected {other:?}"),
        }

        let calls = fake.calls.lock().unwrap();
        assert!(calls[0].0.contains("final_shape = Part.makeBox(1, 1, 1)"));
        assert_eq!(calls[0].1, "make it taller");
    }

    #[tokio::test]
    async fn test_refine_requires_previous_code() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying("final_shape = 1"));
        let copilot = copilot(&fake, dir.path(), None);

        let err = copilot.refine("\n", "make it taller").await.unwrap_err();
        assert!(matches!(err, CopilotError::InvalidRequest(_)));
    }

    // ── Status ───────────────────────────────────────────

    #[tokio::test]
    async fn test_status_without_executable_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying(""));
        let copilot = copilot(&fake, dir.path(), None);

        let report = copilot.status().await;
        assert_eq!(report.status, "error");
        assert!(report.llm_reachable);
        assert!(!report.cad_available);
        assert!(report.cad_executable.is_none());
        assert!(report.output_dir_writable);
        // Probe file is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_all_ok() {
        let bin = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let worker = write_worker(bin.path());
        let fake = Arc::new(FakeGenerator::replying(""));
        let copilot = copilot(&fake, out.path(), Some(&worker));

        let report = copilot.status().await;
        assert_eq!(report.status, "ok");
        assert_eq!(report.llm, "fake (test)");
        assert!(report.cad_executable.unwrap().ends_with("FreeCADCmd"));
    }

    #[tokio::test]
    async fn test_status_missing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::replying(""));
        let copilot = copilot(&fake, &dir.path().join("absent"), None);

        let report = copilot.status().await;
        assert!(!report.output_dir_writable);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(60);
        assert_eq!(preview(&long).chars().count(), 51);
    }
}
