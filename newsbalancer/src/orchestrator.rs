//! Ensemble orchestration.
//!
//! Lock order is cache registry, then progress registry. Checking the cache,
//! claiming a fingerprint, registering its progress channel and subscribing the
//! caller all happen under the cache lock; so do completing and releasing a job.
//! A caller that sees a job in flight is therefore always able to observe it.

use common::ScoringConfig;
use metrics::counter;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::article::{Article, Fingerprint};
use crate::cache::ResultCache;
use crate::calculator::{self, aggregate};
use crate::error::{JobFailure, ScoreError};
use crate::llm::{ModelClient, PerspectiveResult, ResultStatus};
use crate::perspectives::PerspectiveConfig;
use crate::progress::{
    JobStatus, JobStep, PerspectiveStatus, ProgressEvent, ProgressManager, ProgressState, Subscription,
};
use crate::storage::{CompositeScore, NewCompositeScore, ScoreStore};

const GATE_QUEUED: u8 = 0;
const GATE_STARTED: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Tunables taken from the `[scoring]` section.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Max concurrent model calls per job
    pub parallelism: usize,
    pub cache_ttl: Duration,
    pub progress_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            cache_ttl: Duration::from_secs(3600),
            progress_grace: Duration::from_secs(300),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &ScoringConfig) -> Self {
        let default = Self::default();
        Self {
            parallelism: cfg.parallelism.unwrap_or(default.parallelism).max(1),
            cache_ttl: cfg
                .cache_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(default.cache_ttl),
            progress_grace: cfg
                .progress_grace_seconds
                .map(Duration::from_secs)
                .unwrap_or(default.progress_grace),
        }
    }
}

/// How a scoring request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Answered from the cache; no job exists
    Cached,
    /// Attached to a job another caller started
    Joined,
    /// A new job was started for this caller
    Started,
}

/// Returned by [`Orchestrator::request_score`].
pub struct JobHandle {
    pub job_id: Fingerprint,
    pub article_id: i64,
    pub kind: JobKind,
    cached: Option<CompositeScore>,
    initial: Option<Subscription>,
    progress: ProgressManager,
    gate: Option<Arc<AtomicU8>>,
}

impl JobHandle {
    pub fn cached(&self) -> Option<&CompositeScore> {
        self.cached.as_ref()
    }

    /// Event stream for this job. The first call returns the subscription taken
    /// when the request was made, so the caller cannot miss early events.
    pub fn subscribe(&mut self) -> Option<Subscription> {
        if let Some(score) = &self.cached {
            return Some(Subscription::completed(self.job_id.clone(), score.clone()));
        }
        self.initial.take().or_else(|| self.progress.subscribe(&self.job_id))
    }

    /// Cancel the job this caller started. Only honoured before any model call
    /// was dispatched; returns whether it took effect.
    pub fn cancel(&self) -> bool {
        match &self.gate {
            Some(gate) => gate
                .compare_exchange(GATE_QUEUED, GATE_CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }

    /// Wait for the job to end.
    pub async fn wait(mut self) -> Result<CompositeScore, JobFailure> {
        if let Some(score) = self.cached.take() {
            return Ok(score);
        }
        let lost = || JobFailure {
            reason: "internal_error".into(),
            retry: crate::error::RetryHint::RetryNow,
            message: "job progress is no longer available".into(),
        };
        let mut sub = self.subscribe().ok_or_else(lost)?;
        match sub.wait_terminal().await {
            Some(ProgressEvent::Completed(score)) => Ok(score),
            Some(ProgressEvent::Failed(failure)) => Err(failure),
            _ => Err(lost()),
        }
    }
}

/// Ensemble Orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    config: Arc<RwLock<Arc<PerspectiveConfig>>>,
    store: ScoreStore,
    cache: Arc<Mutex<ResultCache>>,
    progress: ProgressManager,
    parallelism: usize,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        config: PerspectiveConfig,
        store: ScoreStore,
        cache: ResultCache,
        progress: ProgressManager,
        parallelism: usize,
    ) -> Self {
        Self {
            client,
            config: Arc::new(RwLock::new(Arc::new(config))),
            store,
            cache: Arc::new(Mutex::new(cache)),
            progress,
            parallelism: parallelism.max(1),
        }
    }

    pub fn with_settings(
        client: Arc<dyn ModelClient>,
        config: PerspectiveConfig,
        store: ScoreStore,
        settings: &OrchestratorSettings,
    ) -> Self {
        Self::new(
            client,
            config,
            store,
            ResultCache::new(settings.cache_ttl),
            ProgressManager::new(settings.progress_grace),
            settings.parallelism,
        )
    }

    /// Current perspective config snapshot.
    pub fn config(&self) -> Arc<PerspectiveConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn progress(&self) -> &ProgressManager {
        &self.progress
    }

    pub fn store(&self) -> &ScoreStore {
        &self.store
    }

    fn lock_cache(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in a new perspective config. A version change drops every cached
    /// result computed under another version. Returns the number dropped.
    pub fn reload_config(&self, config: PerspectiveConfig) -> usize {
        let version = config.version.clone();
        let previous = {
            let mut guard = self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, Arc::new(config))
        };
        if previous.version == version {
            info!(version = %version, "perspective config reloaded, version unchanged");
            return 0;
        }
        let dropped = self.lock_cache().retain_version(&version);
        info!(from = %previous.version, to = %version, dropped, "perspective config version changed");
        dropped
    }

    pub async fn reload_config_from_file(&self, path: &Path) -> anyhow::Result<usize> {
        let config = PerspectiveConfig::from_file(path).await?;
        Ok(self.reload_config(config))
    }

    /// Most recent persisted composite for an article.
    pub async fn latest_score(&self, article_id: i64) -> anyhow::Result<Option<CompositeScore>> {
        self.store.latest(article_id).await
    }

    /// Serve from cache, join a running job, or start a new one.
    pub fn request_score(&self, article: Article) -> JobHandle {
        let config = self.config();
        let fingerprint = article.fingerprint(&config.version);

        let mut cache = self.lock_cache();

        if let Some(entry) = cache.lookup(&fingerprint) {
            let score = entry.composite.clone();
            drop(cache);
            debug!(article_id = article.id, fingerprint = fingerprint.short(), "served from cache");
            counter!("newsbalancer_jobs_total", "outcome" => "cached").increment(1);
            return JobHandle {
                job_id: fingerprint,
                article_id: article.id,
                kind: JobKind::Cached,
                cached: Some(score),
                initial: None,
                progress: self.progress.clone(),
                gate: None,
            };
        }

        if cache.is_in_flight(&fingerprint) {
            let initial = self.progress.subscribe(&fingerprint);
            drop(cache);
            debug!(article_id = article.id, fingerprint = fingerprint.short(), "joined running job");
            counter!("newsbalancer_jobs_total", "outcome" => "joined").increment(1);
            return JobHandle {
                job_id: fingerprint,
                article_id: article.id,
                kind: JobKind::Joined,
                cached: None,
                initial,
                progress: self.progress.clone(),
                gate: None,
            };
        }

        cache.try_claim(&fingerprint);
        self.progress.begin(
            ProgressState::queued(
                fingerprint.clone(),
                article.id,
                config.perspectives.iter().map(|p| p.id.clone()),
            ),
            config.total_calls(),
        );
        let initial = self.progress.subscribe(&fingerprint);
        drop(cache);

        info!(
            article_id = article.id,
            fingerprint = fingerprint.short(),
            config_version = %config.version,
            calls = config.total_calls(),
            "scoring job queued"
        );

        let gate = Arc::new(AtomicU8::new(GATE_QUEUED));
        self.spawn_job(article.clone(), fingerprint.clone(), config, gate.clone());

        JobHandle {
            job_id: fingerprint,
            article_id: article.id,
            kind: JobKind::Started,
            cached: None,
            initial,
            progress: self.progress.clone(),
            gate: Some(gate),
        }
    }

    fn spawn_job(&self, article: Article, fingerprint: Fingerprint, config: Arc<PerspectiveConfig>, gate: Arc<AtomicU8>) {
        let worker = self.clone();
        let supervisor = self.clone();
        let job_fp = fingerprint.clone();

        let job = tokio::spawn(async move {
            if gate
                .compare_exchange(GATE_QUEUED, GATE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                info!(article_id = article.id, fingerprint = job_fp.short(), "scoring job cancelled before start");
                worker.finish(&job_fp, &config, Err(ScoreError::Cancelled));
                return;
            }
            let outcome = worker.execute(&article, &job_fp, &config).await;
            worker.finish(&job_fp, &config, outcome);
        });

        // A panicking job must still release its claim and notify observers.
        tokio::spawn(async move {
            if let Err(e) = job.await {
                error!(fingerprint = fingerprint.short(), error = %e, "scoring job aborted");
                let config = supervisor.config();
                supervisor.finish(&fingerprint, &config, Err(ScoreError::Internal(e.to_string())));
            }
        });
    }

    async fn execute(
        &self,
        article: &Article,
        fingerprint: &Fingerprint,
        config: &PerspectiveConfig,
    ) -> Result<(CompositeScore, Vec<PerspectiveResult>), ScoreError> {
        let total = config.total_calls();
        let mut state = self
            .progress
            .snapshot(fingerprint)
            .unwrap_or_else(|| {
                ProgressState::queued(fingerprint.clone(), article.id, config.perspectives.iter().map(|p| p.id.clone()))
            });
        state.status = JobStatus::InProgress;
        state.step = JobStep::Fetching;
        state.message = format!("Querying {} perspective call(s)", total);
        self.publish(&mut state);

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let shared_article = Arc::new(article.clone());
        let mut calls = JoinSet::new();
        for perspective in &config.perspectives {
            for _ in 0..perspective.samples {
                let client = self.client.clone();
                let semaphore = semaphore.clone();
                let article = shared_article.clone();
                let perspective = perspective.clone();
                calls.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    client.call(&perspective, &article).await
                });
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = calls.join_next().await {
            let result = joined.map_err(|e| ScoreError::Internal(format!("perspective task failed: {}", e)))?;

            self.store
                .upsert_perspective_result(article.id, &result)
                .await
                .map_err(|e| ScoreError::Persistence(format!("{:#}", e)))?;

            let status = PerspectiveStatus::from(result.status);
            state
                .perspectives
                .entry(result.perspective_id.clone())
                .and_modify(|s| {
                    if rank(status) > rank(*s) {
                        *s = status;
                    }
                })
                .or_insert(status);
            results.push(result);
            state.percent = ((results.len() * 100) / total.max(1)).min(100) as u8;
            state.message = format!("{}/{} perspective call(s) finished", results.len(), total);
            self.publish(&mut state);
        }

        let usable: Vec<&PerspectiveResult> = results
            .iter()
            .filter(|r| calculator::is_usable(r, config.min_confidence))
            .collect();
        let usable_perspectives: HashSet<&str> = usable.iter().map(|r| r.perspective_id.as_str()).collect();
        if usable_perspectives.len() < config.quorum {
            let failed = results.iter().filter(|r| r.status == ResultStatus::Failed).count();
            return Err(ScoreError::Quorum {
                valid: usable_perspectives.len(),
                required: config.quorum,
                invalid: results.len() - failed - usable.len(),
                failed,
            });
        }

        state.step = JobStep::Aggregating;
        state.message = "Aggregating".to_string();
        self.publish(&mut state);

        let agg = aggregate(&results, config).map_err(|_| ScoreError::Quorum {
            valid: 0,
            required: config.quorum,
            invalid: results.len(),
            failed: 0,
        })?;

        state.step = JobStep::Storing;
        state.message = "Storing".to_string();
        self.publish(&mut state);

        let composite = self
            .store
            .append_version(&NewCompositeScore {
                article_id: article.id,
                fingerprint: fingerprint.clone(),
                score: agg.score,
                confidence: agg.confidence,
                formula: config.formula,
                confidence_method: config.confidence_method,
                config_version: config.version.clone(),
                valid_perspectives: agg.valid_perspectives(),
            })
            .await
            .map_err(|e| ScoreError::Persistence(format!("{:#}", e)))?;

        info!(
            article_id = article.id,
            fingerprint = fingerprint.short(),
            score = composite.score,
            confidence = composite.confidence,
            version = composite.version,
            valid = agg.valid_perspectives(),
            excluded = agg.excluded,
            "composite score stored"
        );
        Ok((composite, results))
    }

    fn publish(&self, state: &mut ProgressState) {
        state.last_updated = chrono::Utc::now();
        self.progress.publish(state.clone());
    }

    fn finish(
        &self,
        fingerprint: &Fingerprint,
        config: &PerspectiveConfig,
        outcome: Result<(CompositeScore, Vec<PerspectiveResult>), ScoreError>,
    ) {
        let mut cache = self.lock_cache();
        match outcome {
            Ok((composite, results)) => {
                self.progress.complete(fingerprint, Ok(composite.clone()));
                // A reload during the job makes this result stale for new requests.
                if self.config().version == config.version {
                    cache.insert(fingerprint.clone(), composite, results);
                }
                counter!("newsbalancer_jobs_total", "outcome" => "done").increment(1);
            }
            Err(err) => {
                warn!(fingerprint = fingerprint.short(), reason = err.reason(), error = %err, "scoring job failed");
                self.progress.complete(fingerprint, Err(err.to_failure()));
                counter!("newsbalancer_jobs_total", "outcome" => err.reason()).increment(1);
            }
        }
        cache.release(fingerprint);
    }
}

fn rank(status: PerspectiveStatus) -> u8 {
    match status {
        PerspectiveStatus::Pending => 0,
        PerspectiveStatus::Failed => 1,
        PerspectiveStatus::Invalid => 2,
        PerspectiveStatus::Valid => 3,
    }
}
