//! Chat-completion judge for Ollama and OpenAI-compatible APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use archivist_shared::{ArchivistError, JudgeConfig, JudgeProviderKind, Result};

use crate::{Judge, JudgeSchema, extract_json};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    options: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: AnswerMessage,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: AnswerMessage,
}

#[derive(Debug, Deserialize)]
struct AnswerMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// ChatJudge
// ---------------------------------------------------------------------------

/// Judge backed by a chat-completion HTTP endpoint.
pub struct ChatJudge {
    client: Client,
    provider: JudgeProviderKind,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for ChatJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatJudge")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatJudge {
    /// Build a judge from the `[judge]` config section.
    ///
    /// The OpenAI flavour reads its key from the env var named in
    /// `api_key_env`; a missing key is a config error.
    pub fn new(config: &JudgeConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            ArchivistError::config(format!("invalid judge base_url '{}': {e}", config.base_url))
        })?;

        let segments: &[&str] = match config.provider {
            JudgeProviderKind::Ollama => &["api", "chat"],
            JudgeProviderKind::OpenAi => &["v1", "chat", "completions"],
        };
        let mut endpoint = base.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| ArchivistError::config("judge base_url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);

        let api_key = match config.provider {
            JudgeProviderKind::Ollama => None,
            JudgeProviderKind::OpenAi => match std::env::var(&config.api_key_env) {
                Ok(key) if !key.is_empty() => Some(key),
                _ => {
                    return Err(ArchivistError::config(format!(
                        "judge API key not found. Set the {} environment variable.",
                        config.api_key_env
                    )));
                }
            },
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ArchivistError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider: config.provider,
            endpoint,
            model: config.model.clone(),
            api_key,
        })
    }

    /// Send one chat turn, optionally constrained to `schema`, and return the answer text.
    async fn chat(&self, prompt: &str, schema: Option<&JudgeSchema>) -> Result<String> {
        let message = ChatMessage {
            role: "user",
            content: prompt,
        };

        let mut request = self.client.post(self.endpoint.clone());
        request = match self.provider {
            JudgeProviderKind::Ollama => request.json(&OllamaRequest {
                model: &self.model,
                messages: [message],
                stream: false,
                format: schema.map(|s| &s.schema),
                options: json!({ "temperature": 0 }),
            }),
            JudgeProviderKind::OpenAi => request.json(&OpenAiRequest {
                model: &self.model,
                messages: [message],
                temperature: 0.0,
                response_format: schema.map(|s| {
                    json!({
                        "type": "json_schema",
                        "json_schema": { "name": s.name, "schema": s.schema, "strict": true },
                    })
                }),
            }),
        };
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ArchivistError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(ArchivistError::Judge(format!("HTTP {status}: {preview}")));
        }

        let content = match self.provider {
            JudgeProviderKind::Ollama => {
                let body: OllamaResponse = response.json().await.map_err(|e| {
                    ArchivistError::parse(format!("invalid judge response body: {e}"))
                })?;
                body.message.content
            }
            JudgeProviderKind::OpenAi => {
                let body: OpenAiResponse = response.json().await.map_err(|e| {
                    ArchivistError::parse(format!("invalid judge response body: {e}"))
                })?;
                body.choices.into_iter().next().and_then(|c| c.message.content)
            }
        };

        let content = content.ok_or_else(|| ArchivistError::Judge("judge returned no answer".into()))?;
        debug!(chars = content.len(), "judge answered");
        Ok(content)
    }
}

#[async_trait]
impl Judge for ChatJudge {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.chat(prompt, None).await
    }

    #[instrument(skip_all, fields(model = %self.model, schema = schema.name))]
    async fn invoke_structured(&self, prompt: &str, schema: &JudgeSchema) -> Result<Value> {
        let answer = self.chat(prompt, Some(schema)).await?;
        extract_json(&answer)
    }
}
