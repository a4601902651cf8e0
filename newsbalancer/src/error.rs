use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Invalid perspective document. Fatal at load time; nothing is scored with it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read perspective config `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse perspective config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("perspective config version must not be blank")]
    EmptyVersion,
    #[error("perspective config must list at least one perspective")]
    NoPerspectives,
    #[error("perspective id must not be blank")]
    EmptyPerspectiveId,
    #[error("perspective `{0}` is listed more than once")]
    DuplicatePerspective(String),
    #[error("perspective `{0}` has no model")]
    EmptyModel(String),
    #[error("perspective `{id}` weight must be finite and >= 0 (got {weight})")]
    InvalidWeight { id: String, weight: f64 },
    #[error("perspective `{0}` must request at least one sample")]
    ZeroSamples(String),
    #[error("unknown aggregation formula `{0}` (expected \"weighted\" or \"average\")")]
    UnknownFormula(String),
    #[error("unknown confidence method `{0}` (expected \"average\", \"min\", \"max\" or \"spread_based\")")]
    UnknownConfidenceMethod(String),
    #[error("quorum must be within 1..={perspectives} (got {quorum})")]
    InvalidQuorum { quorum: usize, perspectives: usize },
    #[error("min_confidence must be within 0.0..=1.0 (got {0})")]
    InvalidMinConfidence(f64),
}

/// Category of an HTTP-level failure reported by the LLM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    RateLimit,
    Authentication,
    Credits,
    Streaming,
    Server,
    Client,
}

impl ApiErrorKind {
    pub fn from_status(status: u16, message: &str) -> Self {
        let lower = message.to_lowercase();
        match status {
            429 => Self::RateLimit,
            401 | 403 => Self::Authentication,
            402 => Self::Credits,
            _ if lower.contains("stream") || lower.contains("sse") => Self::Streaming,
            s if s >= 500 => Self::Server,
            _ => Self::Client,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Credits => "credits",
            Self::Streaming => "streaming",
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// Failure of one outbound call to the LLM service.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM HTTP request failed: {0}")]
    Transport(String),
    #[error("LLM API error ({}) {status}: {message}", .kind.as_str())]
    Api {
        status: u16,
        kind: ApiErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("no API key available for the {0} credential")]
    MissingCredential(&'static str),
}

impl ProviderError {
    /// Worth another attempt with the same credential.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Api { kind, .. } => matches!(
                kind,
                ApiErrorKind::RateLimit | ApiErrorKind::Server | ApiErrorKind::Streaming
            ),
            Self::MissingCredential(_) => false,
        }
    }

    /// The credential itself was refused (bad key, no credits); switch keys instead of waiting.
    pub fn rejects_credential(&self) -> bool {
        matches!(
            self,
            Self::Api {
                kind: ApiErrorKind::Authentication | ApiErrorKind::Credits,
                ..
            } | Self::MissingCredential(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used for metrics and stored diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Api { kind, .. } => kind.as_str(),
            Self::MissingCredential(_) => "missing_credential",
        }
    }
}

/// What a caller should do after a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    RetryNow,
    RetryLater,
    Unscoreable,
}

/// Job-level failure, delivered to every observer of the job.
#[derive(Debug, Clone, Error)]
pub enum ScoreError {
    #[error("quorum not reached: {valid} valid perspective(s), {required} required ({invalid} invalid, {failed} failed)")]
    Quorum {
        valid: usize,
        required: usize,
        invalid: usize,
        failed: usize,
    },
    #[error("failed to persist scoring results: {0}")]
    Persistence(String),
    #[error("scoring job cancelled before any perspective started")]
    Cancelled,
    #[error("scoring job aborted: {0}")]
    Internal(String),
}

impl ScoreError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Quorum { .. } => "quorum_failure",
            Self::Persistence(_) => "persistence_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        match self {
            // Every perspective answered but none with a usable number.
            Self::Quorum { failed: 0, .. } => RetryHint::Unscoreable,
            Self::Quorum { .. } | Self::Persistence(_) => RetryHint::RetryLater,
            Self::Cancelled => RetryHint::RetryNow,
            Self::Internal(_) => RetryHint::RetryLater,
        }
    }

    pub fn to_failure(&self) -> JobFailure {
        JobFailure {
            reason: self.reason().to_string(),
            retry: self.retry_hint(),
            message: self.to_string(),
        }
    }
}

/// Serializable terminal error detail sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: String,
    pub retry: RetryHint,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(ApiErrorKind::from_status(429, ""), ApiErrorKind::RateLimit);
        assert_eq!(ApiErrorKind::from_status(401, ""), ApiErrorKind::Authentication);
        assert_eq!(ApiErrorKind::from_status(402, ""), ApiErrorKind::Credits);
        assert_eq!(ApiErrorKind::from_status(503, "SSE stream closed"), ApiErrorKind::Streaming);
        assert_eq!(ApiErrorKind::from_status(502, "bad gateway"), ApiErrorKind::Server);
        assert_eq!(ApiErrorKind::from_status(400, "bad request"), ApiErrorKind::Client);
    }

    #[test]
    fn transient_and_rejecting_errors_are_disjoint() {
        let rate = ProviderError::Api {
            status: 429,
            kind: ApiErrorKind::RateLimit,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(rate.is_transient());
        assert!(!rate.rejects_credential());
        assert_eq!(rate.retry_after(), Some(Duration::from_secs(2)));

        let credits = ProviderError::Api {
            status: 402,
            kind: ApiErrorKind::Credits,
            message: "insufficient credits".into(),
            retry_after: None,
        };
        assert!(!credits.is_transient());
        assert!(credits.rejects_credential());

        let bad_request = ProviderError::Api {
            status: 400,
            kind: ApiErrorKind::Client,
            message: "unknown model".into(),
            retry_after: None,
        };
        assert!(!bad_request.is_transient());
        assert!(!bad_request.rejects_credential());
    }

    #[test]
    fn quorum_failure_hint_depends_on_failures() {
        let all_invalid = ScoreError::Quorum { valid: 0, required: 1, invalid: 3, failed: 0 };
        assert_eq!(all_invalid.retry_hint(), RetryHint::Unscoreable);

        let outage = ScoreError::Quorum { valid: 0, required: 1, invalid: 0, failed: 3 };
        assert_eq!(outage.retry_hint(), RetryHint::RetryLater);

        let failure = outage.to_failure();
        assert_eq!(failure.reason, "quorum_failure");
        assert!(failure.message.contains("0 valid"));
    }
}
