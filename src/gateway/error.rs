//! Typed rejection taxonomy for the code-admission gateway.
//!
//! Validation-stage rejections describe the generated code and are safe
//! to show to the caller verbatim. Execution-stage failures carry the
//! captured worker diagnostics, already scrubbed of host paths.

use std::fmt;

use serde::Serialize;

use crate::sandbox::{ExecutionFailure, SandboxError};

/// Why the static validator refused a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Empty,
    TooLong,
    SyntaxInvalid,
    SecurityViolation,
    SuspiciousNullAssignment,
}

/// A validation-stage rejection: the kind plus a diagnostic detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self.kind {
            RejectionKind::Empty => "Generated script is empty",
            RejectionKind::TooLong => "Script exceeds the maximum allowed length",
            RejectionKind::SyntaxInvalid => "Generated script contains syntax errors",
            RejectionKind::SecurityViolation => "Security violation detected in script",
            RejectionKind::SuspiciousNullAssignment => {
                "Script appears to assign None to a shape variable"
            }
        };
        f.write_str(message)
    }
}

/// Every way the gateway can refuse to hand back an artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Rejected(Rejection),

    #[error("CAD executable is not configured or not found: {0}")]
    Configuration(String),

    #[error("Script execution exceeded the {secs}s deadline")]
    TimedOut { secs: u64 },

    #[error("CAD script execution failed")]
    ProcessFailed(String),

    #[error("Execution succeeded, but no artifact was generated")]
    ArtifactMissing { binding: String },

    #[error("artifact too small to be valid")]
    ArtifactTooSmall { size: u64, min: u64 },

    #[error("Scratch file I/O failed: {0}")]
    Io(String),
}

impl GatewayError {
    /// Maps an execution-stage failure, naming the terminal binding in
    /// the missing-artifact case.
    pub fn from_failure(failure: ExecutionFailure, binding: &str) -> Self {
        match failure {
            ExecutionFailure::ProcessFailed(detail) => GatewayError::ProcessFailed(detail),
            ExecutionFailure::ArtifactMissing => GatewayError::ArtifactMissing {
                binding: binding.to_string(),
            },
            ExecutionFailure::ArtifactTooSmall { size, min } => {
                GatewayError::ArtifactTooSmall { size, min }
            }
        }
    }

    /// True for rejections produced before any execution was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Rejected(_) => "ERR_VALIDATION",
            GatewayError::Configuration(_) => "ERR_CONFIG",
            GatewayError::TimedOut { .. } => "ERR_TIMEOUT",
            GatewayError::ProcessFailed(_)
            | GatewayError::ArtifactMissing { .. }
            | GatewayError::ArtifactTooSmall { .. }
            | GatewayError::Io(_) => "ERR_EXECUTION",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Rejected(_) => "validation_error",
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::TimedOut { .. } => "timeout",
            _ => "execution_error",
        }
    }

    /// Status hint for a transport layer (HTTP semantics).
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Rejected(_) => 400,
            GatewayError::TimedOut { .. } => 408,
            _ => 500,
        }
    }

    /// Finer-grained kind name, e.g. `security_violation` or `artifact_too_small`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Rejected(r) => match r.kind {
                RejectionKind::Empty => "empty",
                RejectionKind::TooLong => "too_long",
                RejectionKind::SyntaxInvalid => "syntax_invalid",
                RejectionKind::SecurityViolation => "security_violation",
                RejectionKind::SuspiciousNullAssignment => "suspicious_null_assignment",
            },
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::TimedOut { .. } => "timed_out",
            GatewayError::ProcessFailed(_) => "process_failed",
            GatewayError::ArtifactMissing { .. } => "artifact_missing",
            GatewayError::ArtifactTooSmall { .. } => "artifact_too_small",
            GatewayError::Io(_) => "io",
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            GatewayError::Rejected(r) if r.detail.is_empty() => None,
            GatewayError::Rejected(r) => Some(r.detail.clone()),
            GatewayError::ProcessFailed(detail) => Some(detail.clone()),
            GatewayError::ArtifactMissing { binding } => Some(format!(
                "Ensure '{binding}' exists and holds a shape; it was never materialized."
            )),
            GatewayError::ArtifactTooSmall { size, min } => {
                Some(format!("Artifact is {size} bytes (minimum {min})"))
            }
            GatewayError::Configuration(_) | GatewayError::TimedOut { .. } | GatewayError::Io(_) => {
                None
            }
        }
    }

    /// Structured, serialisable view of this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            status: "error",
            http_status: self.status_code(),
            code: self.code(),
            error: ErrorDetail {
                error_type: self.error_type(),
                kind: self.kind(),
                message: self.to_string(),
                details: self.details(),
            },
        }
    }
}

impl From<Rejection> for GatewayError {
    fn from(rejection: Rejection) -> Self {
        GatewayError::Rejected(rejection)
    }
}

impl From<SandboxError> for GatewayError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Configuration(msg) | SandboxError::Spawn(msg) => {
                GatewayError::Configuration(msg)
            }
            SandboxError::Io(msg) => GatewayError::Io(msg),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub http_status: u16,
    pub code: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_map_to_400() {
        let err: GatewayError =
            Rejection::new(RejectionKind::SecurityViolation, "Banned import detected: os").into();
        assert!(err.is_validation());
        assert_eq!(err.code(), "ERR_VALIDATION");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.kind(), "security_violation");
        assert_eq!(err.to_string(), "Security violation detected in script");
    }

    #[test]
    fn test_execution_errors_are_distinguishable() {
        let timeout = GatewayError::TimedOut { secs: 30 };
        assert_eq!(timeout.code(), "ERR_TIMEOUT");
        assert_eq!(timeout.status_code(), 408);

        let failed = GatewayError::ProcessFailed("Traceback".to_string());
        let small = GatewayError::ArtifactTooSmall { size: 0, min: 100 };
        assert_eq!(failed.code(), "ERR_EXECUTION");
        assert_eq!(small.code(), "ERR_EXECUTION");
        assert_ne!(failed.kind(), small.kind());
        assert!(!small.is_validation());
    }

    #[test]
    fn test_missing_artifact_names_binding() {
        let err = GatewayError::from_failure(ExecutionFailure::ArtifactMissing, "final_shape");
        assert_eq!(err.kind(), "artifact_missing");
        assert!(err.details().unwrap().contains("final_shape"));
    }

    #[test]
    fn test_sandbox_errors_map_to_configuration() {
        let err: GatewayError = SandboxError::Configuration("<unset>".to_string()).into();
        assert_eq!(err.code(), "ERR_CONFIG");
        let err: GatewayError = SandboxError::Io("disk full".to_string()).into();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_response_json_shape() {
        let err: GatewayError = Rejection::new(RejectionKind::TooLong, "Actual length: 2500").into();
        let json = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["http_status"], 400);
        assert_eq!(json["code"], "ERR_VALIDATION");
        assert_eq!(json["error"]["type"], "validation_error");
        assert_eq!(json["error"]["kind"], "too_long");
        assert_eq!(json["error"]["details"], "Actual length: 2500");
    }

    #[test]
    fn test_response_carries_status_hint() {
        let timeout = serde_json::to_value(GatewayError::TimedOut { secs: 30 }.to_response()).unwrap();
        assert_eq!(timeout["http_status"], 408);
        let config = serde_json::to_value(GatewayError::Configuration("FreeCADCmd".into()).to_response())
            .unwrap();
        assert_eq!(config["http_status"], 500);
    }

    #[test]
    fn test_response_omits_empty_details() {
        let err: GatewayError = Rejection::new(RejectionKind::Empty, "").into();
        let json = serde_json::to_value(err.to_response()).unwrap();
        assert!(json["error"].get("details").is_none());
    }
}
