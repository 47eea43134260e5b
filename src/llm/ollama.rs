//! Ollama code generator.
//!
//! Calls `POST {host}/api/chat` with `stream: false`. The system prompt
//! travels as the first `role: "system"` message; only the assistant's
//! text content is returned. Token usage (`prompt_eval_count` /
//! `eval_count`) may be absent and is only logged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::{with_retries, CodeGenerator, LlmError};
use crate::backoff::Backoff;
use crate::config::LlmConfig;

/// Health probes never wait as long as generation does.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ── Ollama API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

// ── OllamaGenerator ──────────────────────────────────────

pub struct OllamaGenerator {
    client: Client,
    config: LlmConfig,
    host: String,
}

impl OllamaGenerator {
    pub fn new(config: LlmConfig) -> Self {
        // Strip trailing slash for consistent URL construction
        let host = config.host.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            host,
        }
    }

    fn build_request<'a>(&'a self, system_prompt: &'a str, prompt: &'a str) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        ChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            options: ChatOptions {
                num_predict: self.config.max_tokens_per_request,
            },
        }
    }

    async fn chat_once(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.host);
        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let resp: ChatResponse = response.json().await?;
        info!(
            "LLM response: {} in / {} out tokens",
            resp.prompt_eval_count.unwrap_or(0),
            resp.eval_count.unwrap_or(0)
        );

        if resp.message.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(resp.message.content)
    }
}

#[async_trait]
impl CodeGenerator for OllamaGenerator {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError> {
        let request = self.build_request(system_prompt, prompt);
        debug!(
            "Calling Ollama API ({}) with a {}-char prompt",
            self.config.model,
            prompt.len()
        );
        with_retries(Backoff::for_llm(self.config.retries), || {
            self.chat_once(&request)
        })
        .await
    }

    async fn check_health(&self) -> bool {
        match self
            .client
            .get(&self.host)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama health probe failed: {e}");
                false
            }
        }
    }

    fn description(&self) -> String {
        format!("{} ({})", self.config.provider, self.config.model)
    }
}
