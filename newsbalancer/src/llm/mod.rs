use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::article::Article;
use crate::error::ProviderError;
use crate::perspectives::Perspective;

pub mod client;
pub mod parse;
pub mod remote;

/// Which configured API key a request is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Primary,
    Backup,
}

impl Credential {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }
}

/// Transport for one chat completion (local mock or remote service).
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a single request. No retries at this level.
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Whether a backup key is configured.
    fn has_backup(&self) -> bool {
        false
    }
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: String,
    /// Per-perspective endpoint override
    pub endpoint: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout: Option<Duration>,
    pub credential: Credential,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Assistant message content, or the raw body when it has no chat envelope
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Outcome of one perspective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Numeric score and confidence within range
    Valid,
    /// The model answered but the payload was unusable
    Invalid,
    /// No answer after the retry budget was spent
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Raw result of one Model Client call. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveResult {
    pub perspective_id: String,
    pub model: String,
    pub status: ResultStatus,
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub explanation: Option<String>,
    pub latency_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl PerspectiveResult {
    pub fn valid(
        perspective: &Perspective,
        score: f64,
        confidence: f64,
        explanation: Option<String>,
    ) -> Self {
        Self {
            perspective_id: perspective.id.clone(),
            model: perspective.model.clone(),
            status: ResultStatus::Valid,
            score: Some(score),
            confidence: Some(confidence),
            explanation,
            latency_ms: 0,
            attempts: 1,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn invalid(perspective: &Perspective, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Invalid,
            score: None,
            confidence: None,
            error: Some(error.into()),
            ..Self::valid(perspective, 0.0, 0.0, None)
        }
    }

    pub fn failed(perspective: &Perspective, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            ..Self::invalid(perspective, error)
        }
    }

    pub fn with_timing(mut self, latency: Duration, attempts: u32) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self.attempts = attempts;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.status == ResultStatus::Valid
    }
}

/// One perspective, one article, one PerspectiveResult. Never returns an error:
/// failures are carried in the result's status.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(&self, perspective: &Perspective, article: &Article) -> PerspectiveResult;
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}
