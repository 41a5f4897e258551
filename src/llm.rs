//! Chat completions against an OpenAI-compatible endpoint (Groq by default).

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::ProviderError;
use crate::provider::{ChatMessage, CompletionRequest, LlmProvider};

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn extract_reply(body: &str) -> Result<String, ProviderError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|err| ProviderError::Failed(format!("unreadable completion response: {err}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ProviderError::failed("completion response carried no content"))
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!("LLM request failed ({status}): {}", envelope.error.message),
        Err(_) => format!("LLM request failed ({status})"),
    }
}

#[derive(Clone)]
pub struct GroqClient {
    api_key: Option<String>,
    model: String,
    endpoint: String,
    timeout: Duration,
}

impl GroqClient {
    pub fn new(settings: &LlmSettings, timeout: Duration) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            timeout,
        }
    }

    fn post(&self, api_key: &str, payload: serde_json::Value) -> Result<String, ProviderError> {
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let response = agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {api_key}"))
            .send_json(payload);
        match response {
            Ok(response) => response
                .into_string()
                .map_err(|err| ProviderError::Failed(format!("reading completion: {err}"))),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(ProviderError::Failed(error_message(status, &body)))
            }
            Err(err) => Err(ProviderError::Failed(format!("LLM request failed: {err}"))),
        }
    }
}

impl fmt::Debug for GroqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroqClient")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl LlmProvider for GroqClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(ProviderError::failed("GROQ_API_KEY is not configured"));
        };
        let payload = serde_json::to_value(CompletionBody {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        })
        .map_err(|err| ProviderError::Failed(format!("encoding completion request: {err}")))?;

        debug!(model = %self.model, messages = request.messages.len(), "requesting completion");
        let client = self.clone();
        let body = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || client.post(&api_key, payload)),
        )
        .await
        .map_err(|_| ProviderError::Timeout(self.timeout))?
        .map_err(|err| ProviderError::Failed(format!("completion task failed: {err}")))?
        .inspect_err(|err| warn!(error = %err, "completion failed"))?;
        extract_reply(&body)
    }
}
