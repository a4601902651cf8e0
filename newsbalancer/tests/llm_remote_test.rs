use std::sync::Arc;
use std::time::Duration;

use newsbalancer::article::Article;
use newsbalancer::error::{ApiErrorKind, ProviderError};
use newsbalancer::llm::client::{HttpModelClient, RetryPolicy};
use newsbalancer::llm::remote::RemoteLlmProvider;
use newsbalancer::llm::{Credential, LlmProvider, LlmRequest, ModelClient, ResultStatus};
use newsbalancer::perspectives::Perspective;

fn completion(content: &str) -> String {
    serde_json::json!({
        "model": "openai/gpt-4.1-nano",
        "choices": [{
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
    })
    .to_string()
}

fn request(credential: Credential, timeout: Duration) -> LlmRequest {
    LlmRequest {
        model: "openai/gpt-4.1-nano".to_string(),
        prompt: "Test prompt".to_string(),
        endpoint: None,
        max_tokens: Some(100),
        temperature: Some(0.2),
        timeout: Some(timeout),
        credential,
    }
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer primary-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion(r#"{"score": 0.1, "explanation": "ok", "confidence": 0.9}"#))
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "primary-key");
    let response = provider
        .generate(request(Credential::Primary, Duration::from_secs(10)))
        .await
        .expect("successful completion");

    assert!(response.content.contains("\"score\": 0.1"));
    assert_eq!(response.usage.total_tokens, 150);
    assert_eq!(response.model, "openai/gpt-4.1-nano");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_backup_key_header() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer backup-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("Score: 0.2"))
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "primary-key").with_backup_key("backup-key");
    assert!(provider.has_backup());
    provider
        .generate(request(Credential::Backup, Duration::from_secs(10)))
        .await
        .expect("backup completion");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_rate_limit_classification() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_header("retry-after", "3")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "primary-key");
    let err = provider
        .generate(request(Credential::Primary, Duration::from_secs(10)))
        .await
        .expect_err("rate limited");

    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    match err {
        ProviderError::Api { status, kind, message, .. } => {
            assert_eq!(status, 429);
            assert_eq!(kind, ApiErrorKind::RateLimit);
            assert_eq!(message, "Rate limit exceeded");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_embedded_error_on_200() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Insufficient credits", "code": 402}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "primary-key");
    let err = provider
        .generate(request(Credential::Primary, Duration::from_secs(10)))
        .await
        .expect_err("embedded error");

    assert!(err.rejects_credential());
}

#[tokio::test]
async fn test_remote_provider_missing_backup_key() {
    let provider = RemoteLlmProvider::new("http://127.0.0.1:9", "primary-key");
    let err = provider
        .generate(request(Credential::Backup, Duration::from_secs(1)))
        .await
        .expect_err("no backup key");
    assert!(matches!(err, ProviderError::MissingCredential("backup")));
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "primary-key");
    let err = provider
        .generate(request(Credential::Primary, Duration::from_secs(1)))
        .await
        .expect_err("timed out");

    assert!(matches!(err, ProviderError::Timeout(_)));
    assert!(err.to_string().contains("timed out"));
}

fn fast_client(url: String) -> HttpModelClient {
    let provider = Arc::new(RemoteLlmProvider::new(url, "primary-key"));
    HttpModelClient::new(
        provider,
        RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
        },
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_model_client_parses_fenced_json() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion(
            "Here is my rating:\n```json\n{\"score\": -0.35, \"explanation\": \"Leans left\", \"confidence\": 0.75}\n```",
        ))
        .expect(1)
        .create_async()
        .await;

    let perspective = Perspective::new("left", "meta-llama/llama-4-scout", 1.0);
    let result = fast_client(server.url()).call(&perspective, &Article::new(42, "Article body")).await;

    assert_eq!(result.status, ResultStatus::Valid);
    assert_eq!(result.score, Some(-0.35));
    assert_eq!(result.confidence, Some(0.75));
    assert_eq!(result.explanation.as_deref(), Some("Leans left"));
    assert_eq!(result.attempts, 1);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_model_client_exhausts_retries_on_server_error() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(503)
        .with_body("service unavailable")
        .expect(3)
        .create_async()
        .await;

    let perspective = Perspective::new("center", "google/gemini-2.0-flash-001", 1.0);
    let result = fast_client(server.url()).call(&perspective, &Article::new(42, "Article body")).await;

    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert!(result.score.is_none());
    assert!(result.error.as_deref().unwrap_or_default().starts_with("server"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_model_client_marks_non_numeric_reply_invalid() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion(r#"{"score": "fairly right", "confidence": 0.6}"#))
        .expect(1)
        .create_async()
        .await;

    let perspective = Perspective::new("right", "openai/gpt-4.1-nano", 1.0);
    let result = fast_client(server.url()).call(&perspective, &Article::new(42, "Article body")).await;

    assert_eq!(result.status, ResultStatus::Invalid);
    assert!(result.error.as_deref().unwrap_or_default().contains("not a number"));

    mock.assert_async().await;
}
