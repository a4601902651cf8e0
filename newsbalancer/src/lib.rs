// Library interface for newsbalancer modules
// This allows tests and the binary to import modules

pub mod article;
pub mod cache;
pub mod calculator;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod perspectives;
pub mod progress;
pub mod server;
pub mod storage;

use anyhow::{Context, Result};
use common::Config;
use metrics::{describe_counter, describe_histogram};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::llm::client::HttpModelClient;
use crate::llm::remote::RemoteLlmProvider;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::perspectives::PerspectiveConfig;
use crate::storage::ScoreStore;

/// One-time metrics registration so series carry descriptions once a recorder is installed.
pub fn describe_metrics() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "newsbalancer_llm_requests_total",
            "Model client calls by perspective, model and outcome."
        );
        describe_histogram!(
            "newsbalancer_llm_request_duration_seconds",
            "Wall time of one model client call including retries."
        );
        describe_counter!("newsbalancer_cache_hits_total", "Result cache hits.");
        describe_counter!("newsbalancer_cache_misses_total", "Result cache misses.");
        describe_counter!("newsbalancer_jobs_total", "Scoring requests by outcome.");
    });
}

/// Wire the orchestrator from application config: perspective document,
/// remote model client and score store. Invalid perspective config is fatal.
pub async fn build_orchestrator(config: &Config, pool: SqlitePool) -> Result<Orchestrator> {
    describe_metrics();

    let perspectives = PerspectiveConfig::from_file(Path::new(&config.scoring.perspectives_path))
        .await
        .with_context(|| format!("invalid perspective config: {}", config.scoring.perspectives_path))?;

    let llm = config.llm_or_default();
    let provider = RemoteLlmProvider::from_config(&llm)?;
    info!(endpoint = %llm.endpoint()?, backup = llm.backup_api_key_env.is_some(), "LLM provider initialized");
    let client = HttpModelClient::from_config(Arc::new(provider), &llm);

    let settings = OrchestratorSettings::from_config(&config.scoring);
    Ok(Orchestrator::with_settings(
        Arc::new(client),
        perspectives,
        ScoreStore::new(pool),
        &settings,
    ))
}
