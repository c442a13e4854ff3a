//! OpenAI-compatible chat completions client.

use std::time::Duration;

use rand::Rng;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, TextGenerator,
};
use crate::llm::LlmConfig;

const PROVIDER: &str = "openai";

/// Attempts per request (first try plus retries on transient failures).
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubled per attempt, plus jitter.
const BASE_BACKOFF_MS: u64 = 500;
const JITTER_MS: u64 = 250;

/// Cap on a server-supplied `Retry-After`; anything longer is clamped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_base: String,
    api_key: secrecy::SecretString,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait::async_trait]
impl TextGenerator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut last_error: Option<LlmError> = None;
        let mut server_delay: Option<Duration> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = retry_delay(server_delay.take(), attempt - 1);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Retrying LLM request");
                tokio::time::sleep(backoff).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "LLM request transport failure");
                    last_error = Some(LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let status = response.status();
            match status.as_u16() {
                401 | 403 => {
                    return Err(LlmError::AuthFailed {
                        provider: PROVIDER.to_string(),
                    });
                }
                404 => {
                    return Err(LlmError::ModelNotAvailable {
                        provider: PROVIDER.to_string(),
                        model: self.model.clone(),
                    });
                }
                429 => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    warn!(attempt, ?retry_after, "LLM request rate limited");
                    server_delay = retry_after;
                    last_error = Some(LlmError::RateLimited {
                        provider: PROVIDER.to_string(),
                        retry_after,
                    });
                    continue;
                }
                500..=599 => {
                    let reason = error_preview(response).await;
                    warn!(attempt, status = status.as_u16(), reason = %reason, "LLM server error");
                    last_error = Some(LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: format!("HTTP {status}: {reason}"),
                    });
                    continue;
                }
                _ if !status.is_success() => {
                    let reason = error_preview(response).await;
                    return Err(LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: format!("HTTP {status}: {reason}"),
                    });
                }
                _ => {}
            }

            let text = response.text().await.map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to read response body: {e}"),
            })?;
            let wire: WireResponse = serde_json::from_str(&text)?;

            let choice =
                wire.choices
                    .into_iter()
                    .next()
                    .ok_or_else(|| LlmError::InvalidResponse {
                        provider: PROVIDER.to_string(),
                        reason: "response contained no choices".to_string(),
                    })?;
            let usage = wire.usage.unwrap_or_default();

            return Ok(CompletionResponse {
                content: choice.message.content,
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            });
        }

        Err(last_error.unwrap_or_else(|| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: "retries exhausted".to_string(),
        }))
    }
}

/// Reads a truncated error body for diagnostics.
async fn error_preview(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => body.chars().take(200).collect(),
        Err(_) => "<unreadable body>".to_string(),
    }
}

fn backoff_with_jitter(completed_attempts: u32) -> Duration {
    let base = BASE_BACKOFF_MS * 2u64.pow(completed_attempts.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Delay before the next attempt: the server's `Retry-After` when one was
/// given, clamped to `MAX_RETRY_AFTER`; jittered backoff otherwise.
fn retry_delay(server_delay: Option<Duration>, completed_attempts: u32) -> Duration {
    match server_delay {
        Some(wait) => wait.min(MAX_RETRY_AFTER),
        None => backoff_with_jitter(completed_attempts),
    }
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
