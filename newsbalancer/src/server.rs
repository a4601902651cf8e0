//! Thin HTTP/websocket adapter over the orchestrator.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::ServerConfig;
use futures::{Sink, SinkExt, Stream, StreamExt};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, routes, State};
use rocket_ws::{Channel, Message, WebSocket};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::article::{Article, Fingerprint};
use crate::orchestrator::{JobKind, Orchestrator};
use crate::progress::{ProgressState, Subscription};
use crate::storage::CompositeScore;

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Deserialize)]
pub struct ScoreRequest {
    pub article_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ScoreAccepted {
    pub job_id: Fingerprint,
    /// "cached", "joined" or "started"
    pub kind: &'static str,
    /// Present when served from the cache
    pub score: Option<CompositeScore>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: i64,
    config_version: String,
}

#[get("/health")]
async fn health(state: &State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        config_version: state.orchestrator.config().version.clone(),
    })
}

/// Queue a scoring job. 200 with the score when cached, 202 otherwise.
#[post("/api/score", data = "<body>")]
async fn request_score(state: &State<AppState>, body: Json<ScoreRequest>) -> Result<(Status, Json<ScoreAccepted>), Status> {
    let body = body.into_inner();
    if body.content.trim().is_empty() {
        return Err(Status::UnprocessableEntity);
    }
    let article = Article {
        id: body.article_id,
        title: body.title,
        content: body.content,
    };

    let handle = state.orchestrator.request_score(article);
    let (status, kind) = match handle.kind {
        JobKind::Cached => (Status::Ok, "cached"),
        JobKind::Joined => (Status::Accepted, "joined"),
        JobKind::Started => (Status::Accepted, "started"),
    };
    Ok((
        status,
        Json(ScoreAccepted {
            job_id: handle.job_id.clone(),
            kind,
            score: handle.cached().cloned(),
        }),
    ))
}

/// Current progress snapshot, for polling clients.
#[get("/api/score/<job_id>/progress")]
async fn job_progress(state: &State<AppState>, job_id: &str) -> Option<Json<ProgressState>> {
    state
        .orchestrator
        .progress()
        .snapshot(&Fingerprint::from_hex(job_id))
        .map(Json)
}

#[get("/api/articles/<article_id>/score")]
async fn latest_score(state: &State<AppState>, article_id: i64) -> Result<Option<Json<CompositeScore>>, Status> {
    match state.orchestrator.latest_score(article_id).await {
        Ok(score) => Ok(score.map(Json)),
        Err(e) => {
            error!(article_id, error = %format!("{:#}", e), "failed to load latest score");
            Err(Status::InternalServerError)
        }
    }
}

#[get("/api/articles/<article_id>/history")]
async fn score_history(state: &State<AppState>, article_id: i64) -> Result<Json<Vec<CompositeScore>>, Status> {
    state
        .orchestrator
        .store()
        .history(article_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(article_id, error = %format!("{:#}", e), "failed to load score history");
            Status::InternalServerError
        })
}

/// Live event stream for one job. Closing the socket only ends this observer.
#[get("/score/<job_id>")]
fn job_events(ws: WebSocket, job_id: String, state: &State<AppState>) -> Channel<'static> {
    let progress = state.orchestrator.progress().clone();

    ws.channel(move |mut stream| {
        Box::pin(async move {
            let fingerprint = Fingerprint::from_hex(job_id);
            let Some(sub) = progress.subscribe(&fingerprint) else {
                let body = serde_json::json!({ "type": "error", "message": "unknown job" }).to_string();
                let _ = stream.send(Message::Text(body)).await;
                return Ok(());
            };
            let (outgoing, incoming) = stream.split();
            forward_events(sub, outgoing, incoming).await;
            Ok(())
        })
    })
}

/// Send a job's events to one peer as JSON text frames until the terminal
/// event, a close from the peer, or a failed send.
pub async fn forward_events<Tx, Rx, E>(mut sub: Subscription, mut outgoing: Tx, mut incoming: Rx)
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    info!(job = sub.job_id.short(), observer = %sub.id, "websocket observer attached");

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let body = match serde_json::to_string(&event) {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "failed to serialize progress event");
                        break;
                    }
                };
                if outgoing.send(Message::Text(body)).await.is_err() {
                    sub.cancel();
                    break;
                }
            }
            incoming = incoming.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    sub.cancel();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(job = sub.job_id.short(), observer = %sub.id, "websocket observer detached");
}

pub fn build_rocket(orchestrator: Orchestrator, server: Option<&ServerConfig>) -> rocket::Rocket<rocket::Build> {
    let state = AppState {
        started_at: Utc::now(),
        orchestrator,
    };

    let mut fig = rocket::Config::figment();
    if let Some(server) = server {
        if let Some(bind) = &server.bind {
            fig = fig.merge(("address", bind.clone()));
        }
        if let Some(port) = server.port {
            fig = fig.merge(("port", port));
        }
    }

    rocket::custom(fig)
        .manage(state)
        .mount(
            "/",
            routes![health, request_score, job_progress, latest_score, score_history],
        )
        .mount("/ws", routes![job_events])
}

pub async fn launch_rocket(orchestrator: Orchestrator, server: Option<&ServerConfig>) -> Result<()> {
    info!("Starting Rocket HTTP server");
    build_rocket(orchestrator, server)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;
    info!("Rocket HTTP server has shut down");
    Ok(())
}
