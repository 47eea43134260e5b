//! Code-admission gateway: untrusted script text in, verified artifact
//! (or a typed rejection) out.
//!
//! Normalizer → Validator → (accepted only) Executor → Verifier.

pub mod error;
pub mod normalize;
pub mod policy;
pub mod validator;

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::sandbox::{ExecutionResult, Executor};

pub use error::GatewayError;
pub use normalize::normalize;
pub use policy::ValidationPolicy;
pub use validator::{validate, NormalizedSource, Observations, Verdict};

/// Public prefix under which artifacts are served.
pub const ARTIFACT_URL_PREFIX: &str = "/outputs";

/// A verified artifact together with the source that produced it.
#[derive(Debug, Clone)]
pub struct Admission {
    pub artifact_id: String,
    pub artifact_path: PathBuf,
    pub source: NormalizedSource,
}

impl Admission {
    pub fn to_response(&self) -> AdmissionResponse {
        AdmissionResponse {
            status: "success",
            artifact_id: self.artifact_id.clone(),
            artifact_url: format!("{ARTIFACT_URL_PREFIX}/{}", self.artifact_id),
            code: self.source.as_str().to_string(),
            synthesized_binding: self.source.synthesized_binding(),
            observations: self.source.observations().clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub status: &'static str,
    pub artifact_id: String,
    pub artifact_url: String,
    pub code: String,
    pub synthesized_binding: bool,
    pub observations: Observations,
}

pub struct Gateway {
    policy: ValidationPolicy,
    executor: Executor,
}

impl Gateway {
    pub fn new(policy: ValidationPolicy, executor: Executor) -> Self {
        Self { policy, executor }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Normalizes and validates without executing anything.
    pub fn check(&self, candidate: &str) -> Verdict {
        validate(&normalize(candidate), &self.policy)
    }

    /// Full admission: only an accepted source reaches the executor, and
    /// only a verified artifact is returned.
    pub async fn admit(&self, candidate: &str) -> Result<Admission, GatewayError> {
        let source = self.check(candidate).into_result()?;

        match self.executor.execute(&source).await? {
            ExecutionResult::Success(artifact_path) => {
                let artifact_id = artifact_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!("Admitted script, artifact {artifact_id}");
                Ok(Admission {
                    artifact_id,
                    artifact_path,
                    source,
                })
            }
            ExecutionResult::Failed(failure) => {
                Err(GatewayError::from_failure(failure, source.binding()))
            }
            ExecutionResult::TimedOut => Err(GatewayError::TimedOut {
                secs: self.executor.deadline().as_secs(),
            }),
        }
    }
}
