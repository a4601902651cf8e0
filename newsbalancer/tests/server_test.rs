use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;
use std::sync::Arc;
use std::time::Duration;

use newsbalancer::article::Article;
use newsbalancer::llm::{ModelClient, PerspectiveResult};
use newsbalancer::orchestrator::{JobKind, Orchestrator, OrchestratorSettings};
use newsbalancer::perspectives::{ConfidenceMethod, Formula, Perspective, PerspectiveConfig};
use newsbalancer::server::{build_rocket, forward_events};
use newsbalancer::storage::ScoreStore;
use rocket_ws::Message;

struct FixedClient;

#[async_trait]
impl ModelClient for FixedClient {
    async fn call(&self, perspective: &Perspective, _article: &Article) -> PerspectiveResult {
        PerspectiveResult::valid(perspective, 0.25, 0.9, None)
    }
}

async fn client() -> (Client, Orchestrator) {
    let pool = common::init_memory_pool().await.expect("in-memory db");
    let config = PerspectiveConfig::new(
        "test-1",
        Formula::Weighted,
        ConfidenceMethod::Min,
        1,
        vec![Perspective::new("center", "model-b", 1.0)],
    )
    .expect("valid config");
    let settings = OrchestratorSettings {
        parallelism: 2,
        cache_ttl: Duration::from_secs(60),
        progress_grace: Duration::from_secs(60),
    };
    let orchestrator = Orchestrator::with_settings(Arc::new(FixedClient), config, ScoreStore::new(pool), &settings);
    let client = Client::tracked(build_rocket(orchestrator.clone(), None))
        .await
        .expect("valid rocket instance");
    (client, orchestrator)
}

#[rocket::async_test]
async fn test_health_reports_config_version() {
    let (client, _) = client().await;
    let response = client.get("/health").dispatch().await;
    assert_eq!(response.status(), Status::Ok);

    let body: serde_json::Value = response.into_json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["config_version"], "test-1");
}

#[rocket::async_test]
async fn test_score_request_lifecycle() {
    let (client, orchestrator) = client().await;
    let payload = r#"{"article_id": 21, "title": "Budget", "content": "Parliament passed the budget."}"#;

    let response = client
        .post("/api/score")
        .header(ContentType::JSON)
        .body(payload)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Accepted);
    let accepted: serde_json::Value = response.into_json().await.expect("json body");
    assert_eq!(accepted["kind"], "started");
    let job_id = accepted["job_id"].as_str().expect("job id").to_string();

    let fingerprint = Article::new(21, "Parliament passed the budget.").fingerprint("test-1");
    assert_eq!(job_id, fingerprint.as_str());
    let mut sub = orchestrator.progress().subscribe(&fingerprint).expect("job registered");
    sub.wait_terminal().await.expect("terminal event");

    let progress = client.get(format!("/api/score/{}/progress", job_id)).dispatch().await;
    assert_eq!(progress.status(), Status::Ok);
    let state: serde_json::Value = progress.into_json().await.expect("json body");
    assert_eq!(state["status"], "done");
    assert_eq!(state["percent"], 100);

    let cached = client
        .post("/api/score")
        .header(ContentType::JSON)
        .body(payload)
        .dispatch()
        .await;
    assert_eq!(cached.status(), Status::Ok);
    let cached: serde_json::Value = cached.into_json().await.expect("json body");
    assert_eq!(cached["kind"], "cached");
    assert_eq!(cached["score"]["version"], 1);

    let latest = client.get("/api/articles/21/score").dispatch().await;
    assert_eq!(latest.status(), Status::Ok);
    let latest: serde_json::Value = latest.into_json().await.expect("json body");
    assert_eq!(latest["score"], 0.25);
    assert_eq!(latest["config_version"], "test-1");

    let history = client.get("/api/articles/21/history").dispatch().await;
    let history: serde_json::Value = history.into_json().await.expect("json body");
    assert_eq!(history.as_array().map(|v| v.len()), Some(1));
}

#[rocket::async_test]
async fn test_empty_content_is_rejected() {
    let (client, _) = client().await;
    let response = client
        .post("/api/score")
        .header(ContentType::JSON)
        .body(r#"{"article_id": 1, "content": "   "}"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::UnprocessableEntity);
}

#[rocket::async_test]
async fn test_unknown_article_and_job_are_not_found() {
    let (client, _) = client().await;
    assert_eq!(client.get("/api/articles/404/score").dispatch().await.status(), Status::NotFound);
    assert_eq!(
        client.get("/api/score/deadbeef/progress").dispatch().await.status(),
        Status::NotFound
    );
}

fn frame_type(message: &Message) -> String {
    match message {
        Message::Text(body) => {
            let value: serde_json::Value = serde_json::from_str(body).expect("json frame");
            value["type"].as_str().unwrap_or_default().to_string()
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[rocket::async_test]
async fn test_websocket_streams_until_terminal_event() {
    let (_client, orchestrator) = client().await;
    let mut handle = orchestrator.request_score(Article::new(31, "Streamed article"));
    assert_eq!(handle.kind, JobKind::Started);
    let sub = handle.subscribe().expect("observer");

    let (outgoing, received) = mpsc::unbounded::<Message>();
    let incoming = stream::pending::<Result<Message, std::io::Error>>();
    forward_events(sub, outgoing, incoming).await;

    let frames: Vec<Message> = received.collect().await;
    let types: Vec<String> = frames.iter().map(frame_type).collect();
    assert!(types.len() >= 2);
    assert_eq!(types.first().map(String::as_str), Some("progress"));
    assert_eq!(types.last().map(String::as_str), Some("completed"));
    assert_eq!(types.iter().filter(|t| *t == "completed").count(), 1);

    match frames.last() {
        Some(Message::Text(body)) => {
            let value: serde_json::Value = serde_json::from_str(body).expect("json frame");
            assert_eq!(value["article_id"], 31);
            assert_eq!(value["version"], 1);
        }
        other => panic!("unexpected last frame: {:?}", other),
    }
}

#[rocket::async_test]
async fn test_websocket_close_leaves_job_running() {
    let (_client, orchestrator) = client().await;
    let mut handle = orchestrator.request_score(Article::new(32, "Reader hangs up"));
    let sub = handle.subscribe().expect("observer");

    let (outgoing, _received) = mpsc::unbounded::<Message>();
    let incoming = stream::iter(vec![Ok::<_, std::io::Error>(Message::Close(None))]);
    forward_events(sub, outgoing, incoming).await;

    let score = handle.wait().await.expect("job still completes");
    assert_eq!(score.article_id, 32);
}
