/*
newsbalancer - single-binary main.rs
Runs the scoring HTTP adapter, or scores a single article from the command line.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{init_db_pool, run_migrations, Config};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use newsbalancer::article::Article;
use newsbalancer::build_orchestrator;
use newsbalancer::perspectives::PerspectiveConfig;
use newsbalancer::progress::ProgressEvent;
use newsbalancer::server::launch_rocket;
use newsbalancer::storage::ScoreStore;

#[derive(Parser, Debug)]
#[command(name = "newsbalancer", about = "Ensemble LLM political-bias scoring")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + websocket adapter
    Serve,
    /// Score one article and stream progress to stdout
    Score {
        #[arg(long)]
        article_id: i64,
        /// Article text file, `-` for stdin
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },
    /// Print the latest stored composite score of an article
    Latest {
        #[arg(long)]
        article_id: i64,
        /// Print every stored version instead
        #[arg(long)]
        history: bool,
    },
    /// Validate a perspective config file
    CheckConfig {
        /// Defaults to scoring.perspectives_path from the app config
        #[arg(long, value_name = "FILE")]
        perspectives: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if let Command::CheckConfig { perspectives: Some(path) } = &args.command {
        return check_config(path).await;
    }

    let config = load_config(args.config.as_deref()).await?;

    match args.command {
        Command::CheckConfig { .. } => check_config(Path::new(&config.scoring.perspectives_path)).await,
        Command::Serve => serve(&config).await,
        Command::Score { article_id, file, title } => score(&config, article_id, &file, title).await,
        Command::Latest { article_id, history } => latest(&config, article_id, history).await,
    }
}

async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(default_path.as_path()) } else { None },
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(error = %format!("{:#}", e), "failed to load configuration");
        e
    })?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

async fn open_pool(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_path = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path, "resolved DB path");

    let pool = init_db_pool(&db_path).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn check_config(path: &Path) -> Result<()> {
    let cfg = PerspectiveConfig::from_file(path)
        .await
        .with_context(|| format!("perspective config {} is invalid", path.display()))?;
    println!(
        "{}: version {} | formula {} | confidence {} | quorum {}/{} | {} call(s) per article",
        path.display(),
        cfg.version,
        cfg.formula,
        cfg.confidence_method,
        cfg.quorum,
        cfg.perspectives.len(),
        cfg.total_calls()
    );
    for p in &cfg.perspectives {
        println!("  - {} ({}) weight {} samples {}", p.id, p.model, p.weight, p.samples);
    }
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let pool = open_pool(config).await?;
    let orchestrator = build_orchestrator(config, pool).await?;
    launch_rocket(orchestrator, config.server.as_ref()).await
}

async fn score(config: &Config, article_id: i64, file: &Path, title: Option<String>) -> Result<()> {
    let content = if file == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("failed to read article from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read article file {}", file.display()))?
    };

    let pool = open_pool(config).await?;
    let orchestrator = build_orchestrator(config, pool).await?;
    let mut article = Article::new(article_id, content);
    article.title = title;

    let mut handle = orchestrator.request_score(article);
    let mut events = handle
        .subscribe()
        .context("scoring job vanished before it could be observed")?;

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::Progress(state) => {
                println!("[{:>3}%] {:?}: {}", state.percent, state.step, state.message);
            }
            ProgressEvent::Completed(composite) => {
                println!("{}", serde_json::to_string_pretty(&composite)?);
                return Ok(());
            }
            ProgressEvent::Failed(failure) => {
                anyhow::bail!("scoring failed ({}, {:?}): {}", failure.reason, failure.retry, failure.message);
            }
        }
    }
    anyhow::bail!("progress stream ended without a result")
}

async fn latest(config: &Config, article_id: i64, history: bool) -> Result<()> {
    let store = ScoreStore::new(open_pool(config).await?);
    if history {
        let versions = store.history(article_id).await?;
        println!("{}", serde_json::to_string_pretty(&versions)?);
        return Ok(());
    }
    match store.latest(article_id).await? {
        Some(score) => println!("{}", serde_json::to_string_pretty(&score)?),
        None => anyhow::bail!("article {} has no stored score", article_id),
    }
    Ok(())
}
