pub mod client;
pub mod ollama;
pub mod prompt;

pub use client::{CodeGenerator, LlmError};
pub use ollama::OllamaGenerator;
pub use prompt::{refine_system_prompt, MAX_PROMPT_CHARS, SYSTEM_PROMPT};

use crate::config::LlmConfig;

/// Builds the generator for the configured provider.
pub fn from_config(config: &LlmConfig) -> anyhow::Result<Box<dyn CodeGenerator>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaGenerator::new(config.clone()))),
        other => anyhow::bail!("Unsupported LLM provider: {other}"),
    }
}
