use anyhow::Result;
use common::LlmConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{Credential, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use crate::error::{ApiErrorKind, ProviderError};

/// Remote LLM provider using an OpenAI-compatible chat completions API.
///
/// Holds up to two API keys; the caller picks one per request through
/// [`LlmRequest::credential`].
pub struct RemoteLlmProvider {
    base_url: String,
    primary_key: Option<String>,
    backup_key: Option<String>,
    default_timeout: Duration,
    default_max_tokens: usize,
    default_temperature: f32,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            primary_key: Some(api_key.into()),
            backup_key: None,
            default_timeout: Duration::from_secs(60),
            default_max_tokens: 300,
            default_temperature: 0.2,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_backup_key(mut self, key: impl Into<String>) -> Self {
        self.backup_key = Some(key.into());
        self
    }

    pub fn with_defaults(mut self, timeout: Duration, max_tokens: usize, temperature: f32) -> Self {
        self.default_timeout = timeout;
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    /// Build from the `[llm]` section, reading keys from the named env vars.
    ///
    /// A missing primary key is not an error here; requests made with it fail
    /// with [`ProviderError::MissingCredential`] and fall through to the backup.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let endpoint = cfg.endpoint()?;
        let primary_key = read_key(cfg.api_key_env.as_deref().unwrap_or("LLM_API_KEY"));
        let backup_key = cfg.backup_api_key_env.as_deref().and_then(read_key);
        if primary_key.is_none() && backup_key.is_none() {
            warn!("no LLM API key found in the environment; every model call will fail");
        }

        Ok(Self {
            base_url: endpoint.to_string(),
            primary_key,
            backup_key,
            default_timeout: cfg.timeout(),
            default_max_tokens: cfg.max_tokens.unwrap_or(300),
            default_temperature: cfg.temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        })
    }

    fn key_for(&self, credential: Credential) -> Option<&str> {
        match credential {
            Credential::Primary => self.primary_key.as_deref(),
            Credential::Backup => self.backup_key.as_deref(),
        }
    }
}

fn read_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let api_key = self
            .key_for(request.credential)
            .ok_or(ProviderError::MissingCredential(request.credential.as_str()))?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let url = request.endpoint.as_deref().unwrap_or(&self.base_url);

        let req_body = OpenAiRequest {
            model: request.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt,
            }],
            max_tokens: Some(request.max_tokens.unwrap_or(self.default_max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.default_temperature)),
        };

        // Body read is inside the timeout too; a stalled stream counts as a timeout.
        let exchange = async {
            let response = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .header("X-Title", "NewsBalancer")
                .json(&req_body)
                .send()
                .await?;
            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, retry_after, body))
        };

        let (status, retry_after, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| body.clone());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                kind: ApiErrorKind::from_status(status.as_u16(), &message),
                message,
                retry_after,
            });
        }

        if let Some(err) = embedded_error(&body, retry_after) {
            return Err(err);
        }

        // A 200 without a chat envelope is handed on verbatim; the parser decides.
        let response = match serde_json::from_str::<OpenAiResponse>(&body) {
            Ok(resp) => {
                let usage = resp.usage.unwrap_or_default();
                LlmResponse {
                    content: resp
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .unwrap_or_default(),
                    usage: UsageMetadata {
                        prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                        completion_tokens: usage.completion_tokens.unwrap_or(0),
                        total_tokens: usage.total_tokens.unwrap_or(0),
                    },
                    model: resp.model.unwrap_or(request.model),
                }
            }
            Err(_) => LlmResponse {
                content: body,
                usage: UsageMetadata::default(),
                model: request.model,
            },
        };

        Ok(response)
    }

    fn has_backup(&self) -> bool {
        self.backup_key.is_some()
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let err = value.get("error")?;
    match err.get("message").and_then(|m| m.as_str()) {
        Some(msg) => Some(msg.to_string()),
        None => err.as_str().map(str::to_string),
    }
}

/// Some gateways answer 200 with `{"error": {...}}` instead of a status code.
fn embedded_error(body: &str, retry_after: Option<Duration>) -> Option<ProviderError> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let err = value.get("error")?;
    if !err.is_object() {
        return None;
    }
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unspecified provider error")
        .to_string();
    let code = err
        .get("code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .and_then(|c| u16::try_from(c).ok())
        .filter(|c| (400..600).contains(c));

    let lower = message.to_lowercase();
    let kind = if code == Some(429) || lower.contains("rate limit") {
        ApiErrorKind::RateLimit
    } else if let Some(code) = code {
        ApiErrorKind::from_status(code, &message)
    } else {
        ApiErrorKind::Server
    };

    Some(ProviderError::Api {
        status: code.unwrap_or(200),
        kind,
        message,
        retry_after,
    })
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}
