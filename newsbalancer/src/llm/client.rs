use common::LlmConfig;
use metrics::{counter, histogram};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::parse::parse_score;
use super::{Credential, LlmProvider, LlmRequest, ModelClient, PerspectiveResult};
use crate::article::Article;
use crate::error::ProviderError;
use crate::perspectives::Perspective;

/// Exponential backoff with jitter for transient provider errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per credential after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        let default = Self::default();
        Self {
            max_retries: cfg.max_retries.unwrap_or(default.max_retries),
            backoff_base: cfg
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(default.backoff_base),
            backoff_max: cfg
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(default.backoff_max),
        }
    }

    /// Delay before retry number `retry` (1-based). A server supplied
    /// `Retry-After` replaces the computed delay but is still capped.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.backoff_max);
        }
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let exp = self.backoff_base.saturating_mul(factor).min(self.backoff_max);
        let jitter_cap = (exp.as_millis() as u64) / 4;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        (exp + Duration::from_millis(jitter)).min(self.backoff_max)
    }
}

/// Model Client over an [`LlmProvider`]: prompt building, timeout, retries,
/// credential fallback and response validation.
pub struct HttpModelClient {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    timeout: Duration,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl HttpModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            timeout,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn from_config(provider: Arc<dyn LlmProvider>, cfg: &LlmConfig) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from_config(cfg),
            timeout: cfg.timeout(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }

    fn request(&self, perspective: &Perspective, prompt: &str, credential: Credential) -> LlmRequest {
        LlmRequest {
            model: perspective.model.clone(),
            prompt: prompt.to_string(),
            endpoint: perspective.endpoint.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: Some(self.timeout),
            credential,
        }
    }
}

#[async_trait::async_trait]
impl ModelClient for HttpModelClient {
    async fn call(&self, perspective: &Perspective, article: &Article) -> PerspectiveResult {
        let started = Instant::now();
        let prompt = perspective.format_prompt(&article.content);

        let mut credentials = vec![Credential::Primary];
        if self.provider.has_backup() {
            credentials.push(Credential::Backup);
        }

        let mut attempts = 0u32;
        let mut last_error: Option<ProviderError> = None;

        'credentials: for credential in credentials {
            for retry in 0..=self.policy.max_retries {
                attempts += 1;
                debug!(
                    article_id = article.id,
                    perspective = %perspective.id,
                    model = %perspective.model,
                    credential = credential.as_str(),
                    attempt = attempts,
                    "calling model"
                );

                let err = match self
                    .provider
                    .generate(self.request(perspective, &prompt, credential))
                    .await
                {
                    Ok(response) => {
                        let result = match parse_score(&response.content) {
                            Ok(parsed) => PerspectiveResult::valid(
                                perspective,
                                parsed.score,
                                parsed.confidence,
                                parsed.explanation,
                            ),
                            Err(e) => {
                                warn!(
                                    article_id = article.id,
                                    perspective = %perspective.id,
                                    model = %perspective.model,
                                    error = %e,
                                    "invalid model response"
                                );
                                PerspectiveResult::invalid(perspective, e.to_string())
                            }
                        };
                        return finish(result, perspective, started, attempts);
                    }
                    Err(err) => err,
                };

                warn!(
                    article_id = article.id,
                    perspective = %perspective.id,
                    model = %perspective.model,
                    credential = credential.as_str(),
                    attempt = attempts,
                    error = %err,
                    "model call failed"
                );

                if err.rejects_credential() {
                    last_error = Some(err);
                    continue 'credentials;
                }
                if !err.is_transient() {
                    last_error = Some(err);
                    break 'credentials;
                }
                let retry_after = err.retry_after();
                last_error = Some(err);
                if retry < self.policy.max_retries {
                    let delay = self.policy.delay(retry + 1, retry_after);
                    debug!(perspective = %perspective.id, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }
            }
            if credential == Credential::Primary {
                info!(perspective = %perspective.id, "primary credential exhausted");
            }
        }

        let message = last_error
            .map(|e| format!("{}: {}", e.label(), e))
            .unwrap_or_else(|| "no attempt made".to_string());
        finish(
            PerspectiveResult::failed(perspective, message),
            perspective,
            started,
            attempts,
        )
    }
}

fn finish(
    result: PerspectiveResult,
    perspective: &Perspective,
    started: Instant,
    attempts: u32,
) -> PerspectiveResult {
    let elapsed = started.elapsed();
    counter!(
        "newsbalancer_llm_requests_total",
        "perspective" => perspective.id.clone(),
        "model" => perspective.model.clone(),
        "outcome" => result.status.as_str()
    )
    .increment(1);
    histogram!(
        "newsbalancer_llm_request_duration_seconds",
        "perspective" => perspective.id.clone(),
        "model" => perspective.model.clone()
    )
    .record(elapsed.as_secs_f64());
    result.with_timing(elapsed, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;
    use crate::llm::{LlmResponse, ResultStatus, UsageMetadata};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes and records the credential of each request.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        seen: Mutex<Vec<Credential>>,
        backup: bool,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String, ProviderError>>, backup: bool) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                backup,
            })
        }

        fn seen(&self) -> Vec<Credential> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
            self.seen.lock().unwrap().push(request.credential);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Transport("script exhausted".into())));
            next.map(|content| LlmResponse {
                content,
                usage: UsageMetadata::default(),
                model: request.model,
            })
        }

        fn has_backup(&self) -> bool {
            self.backup
        }
    }

    fn api(status: u16) -> ProviderError {
        ProviderError::Api {
            status,
            kind: ApiErrorKind::from_status(status, ""),
            message: format!("status {}", status),
            retry_after: None,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn client(provider: Arc<ScriptedProvider>, retries: u32) -> HttpModelClient {
        HttpModelClient::new(provider, fast_policy(retries), Duration::from_secs(5))
    }

    const GOOD: &str = r#"{"score": 0.2, "explanation": "ok", "confidence": 0.9}"#;

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let provider = ScriptedProvider::new(vec![Err(api(503)), Err(api(429)), Ok(GOOD.into())], false);
        let result = client(provider.clone(), 2)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert_eq!(result.status, ResultStatus::Valid);
        assert_eq!(result.score, Some(0.2));
        assert_eq!(result.attempts, 3);
        assert_eq!(provider.seen(), vec![Credential::Primary; 3]);
    }

    #[tokio::test]
    async fn switches_to_backup_after_primary_exhausted() {
        let provider = ScriptedProvider::new(vec![Err(api(500)), Err(api(500)), Ok(GOOD.into())], true);
        let result = client(provider.clone(), 1)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert!(result.is_valid());
        assert_eq!(
            provider.seen(),
            vec![Credential::Primary, Credential::Primary, Credential::Backup]
        );
    }

    #[tokio::test]
    async fn credit_error_switches_key_immediately() {
        let provider = ScriptedProvider::new(vec![Err(api(402)), Ok(GOOD.into())], true);
        let result = client(provider.clone(), 3)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert!(result.is_valid());
        assert_eq!(provider.seen(), vec![Credential::Primary, Credential::Backup]);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(api(400))], true);
        let result = client(provider.clone(), 3)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert!(result.error.as_deref().unwrap_or_default().starts_with("client"));
    }

    #[tokio::test]
    async fn invalid_payload_is_recorded_not_retried() {
        let provider = ScriptedProvider::new(
            vec![Ok(r#"{"score": 0.1, "confidence": 1e9}"#.into()), Ok(GOOD.into())],
            false,
        );
        let result = client(provider.clone(), 3)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert_eq!(result.status, ResultStatus::Invalid);
        assert!(result.confidence.is_none());
        assert_eq!(provider.seen().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_failed_result() {
        let provider = ScriptedProvider::new(vec![], false);
        let result = client(provider.clone(), 2)
            .call(&Perspective::new("left", "m", 1.0), &Article::new(1, "text"))
            .await;

        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_deref().unwrap_or_default().contains("script exhausted"));
    }

    #[test]
    fn delay_grows_and_respects_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
        };
        let first = policy.delay(1, None);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay(3, None);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert_eq!(policy.delay(10, None), Duration::from_millis(1000));
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(30))),
            Duration::from_millis(1000)
        );
    }
}
