use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::article::Fingerprint;
use crate::llm::{PerspectiveResult, ResultStatus};
use crate::perspectives::{ConfidenceMethod, Formula};

/// One persisted aggregation. Never updated; a re-score appends a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub article_id: i64,
    pub fingerprint: Fingerprint,
    pub score: f64,
    pub confidence: f64,
    /// 1-based, strictly increasing per article
    pub version: i64,
    pub formula: Formula,
    pub confidence_method: ConfidenceMethod,
    pub config_version: String,
    pub valid_perspectives: usize,
    pub created_at: DateTime<Utc>,
}

/// Everything but the version, which the store assigns.
#[derive(Debug, Clone)]
pub struct NewCompositeScore {
    pub article_id: i64,
    pub fingerprint: Fingerprint,
    pub score: f64,
    pub confidence: f64,
    pub formula: Formula,
    pub confidence_method: ConfidenceMethod,
    pub config_version: String,
    pub valid_perspectives: usize,
}

/// Score Store over SQLite.
#[derive(Clone)]
pub struct ScoreStore {
    pool: SqlitePool,
}

impl ScoreStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record the raw result of a perspective call, one row per
    /// (article, perspective). The latest valid result wins; an invalid or
    /// failed result only replaces a row that is not valid itself.
    pub async fn upsert_perspective_result(&self, article_id: i64, result: &PerspectiveResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO perspective_results
                (article_id, perspective, model, status, score, confidence, explanation,
                 latency_ms, attempts, error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(article_id, perspective) DO UPDATE SET
                model = excluded.model,
                status = excluded.status,
                score = excluded.score,
                confidence = excluded.confidence,
                explanation = excluded.explanation,
                latency_ms = excluded.latency_ms,
                attempts = excluded.attempts,
                error = excluded.error,
                updated_at = excluded.updated_at
            WHERE excluded.status = 'valid' OR perspective_results.status <> 'valid'
            "#,
        )
        .bind(article_id)
        .bind(&result.perspective_id)
        .bind(&result.model)
        .bind(result.status.as_str())
        .bind(result.score)
        .bind(result.confidence)
        .bind(&result.explanation)
        .bind(result.latency_ms as i64)
        .bind(result.attempts as i64)
        .bind(&result.error)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to upsert result for article {} perspective {}",
                article_id, result.perspective_id
            )
        })?;

        debug!(article_id, perspective = %result.perspective_id, status = result.status.as_str(), "perspective result stored");
        Ok(())
    }

    /// Append a composite score under the next version for its article.
    ///
    /// The version is computed inside the INSERT itself, so concurrent appends
    /// for one article are serialized by SQLite's write lock; the
    /// UNIQUE(article_id, version) constraint rejects anything that slips through.
    pub async fn append_version(&self, score: &NewCompositeScore) -> Result<CompositeScore> {
        let created_at = Utc::now();
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO composite_scores
                (article_id, fingerprint, version, score, confidence, formula,
                 confidence_method, config_version, valid_perspectives, created_at)
            SELECT ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?, ?, ?, ?, ?, ?
            FROM composite_scores
            WHERE article_id = ?
            RETURNING version
            "#,
        )
        .bind(score.article_id)
        .bind(score.fingerprint.as_str())
        .bind(score.score)
        .bind(score.confidence)
        .bind(score.formula.as_str())
        .bind(score.confidence_method.as_str())
        .bind(&score.config_version)
        .bind(score.valid_perspectives as i64)
        .bind(created_at)
        .bind(score.article_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to append composite score for article {}", score.article_id))?;

        Ok(CompositeScore {
            article_id: score.article_id,
            fingerprint: score.fingerprint.clone(),
            score: score.score,
            confidence: score.confidence,
            version,
            formula: score.formula,
            confidence_method: score.confidence_method,
            config_version: score.config_version.clone(),
            valid_perspectives: score.valid_perspectives,
            created_at,
        })
    }

    /// Highest version for the article, if it was ever scored.
    pub async fn latest(&self, article_id: i64) -> Result<Option<CompositeScore>> {
        let row = sqlx::query(
            r#"
            SELECT article_id, fingerprint, version, score, confidence, formula,
                   confidence_method, config_version, valid_perspectives, created_at
            FROM composite_scores
            WHERE article_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load latest score for article {}", article_id))?;

        row.map(|r| composite_from_row(&r)).transpose()
    }

    /// All versions, oldest first.
    pub async fn history(&self, article_id: i64) -> Result<Vec<CompositeScore>> {
        let rows = sqlx::query(
            r#"
            SELECT article_id, fingerprint, version, score, confidence, formula,
                   confidence_method, config_version, valid_perspectives, created_at
            FROM composite_scores
            WHERE article_id = ?
            ORDER BY version ASC
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load score history for article {}", article_id))?;

        rows.iter().map(composite_from_row).collect()
    }

    /// Latest raw result per perspective.
    pub async fn perspective_results(&self, article_id: i64) -> Result<Vec<PerspectiveResult>> {
        let rows = sqlx::query(
            r#"
            SELECT perspective, model, status, score, confidence, explanation,
                   latency_ms, attempts, error, updated_at
            FROM perspective_results
            WHERE article_id = ?
            ORDER BY perspective
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load perspective results for article {}", article_id))?;

        rows.iter().map(perspective_from_row).collect()
    }
}

fn composite_from_row(row: &SqliteRow) -> Result<CompositeScore> {
    let formula: String = row.try_get("formula")?;
    let method: String = row.try_get("confidence_method")?;
    let fingerprint: String = row.try_get("fingerprint")?;
    let valid: i64 = row.try_get("valid_perspectives")?;

    Ok(CompositeScore {
        article_id: row.try_get("article_id")?,
        fingerprint: Fingerprint::from_hex(fingerprint),
        score: row.try_get("score")?,
        confidence: row.try_get("confidence")?,
        version: row.try_get("version")?,
        formula: formula.parse()?,
        confidence_method: method.parse()?,
        config_version: row.try_get("config_version")?,
        valid_perspectives: valid.max(0) as usize,
        created_at: row.try_get("created_at")?,
    })
}

fn perspective_from_row(row: &SqliteRow) -> Result<PerspectiveResult> {
    let status: String = row.try_get("status")?;
    let latency: i64 = row.try_get("latency_ms")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(PerspectiveResult {
        perspective_id: row.try_get("perspective")?,
        model: row.try_get("model")?,
        status: ResultStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown perspective result status `{}`", status))?,
        score: row.try_get("score")?,
        confidence: row.try_get("confidence")?,
        explanation: row.try_get("explanation")?,
        latency_ms: latency.max(0) as u64,
        attempts: attempts.max(0) as u32,
        error: row.try_get("error")?,
        completed_at: row.try_get("updated_at")?,
    })
}
