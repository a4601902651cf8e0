//! Progress fan-out for scoring jobs.
//!
//! Each job owns one broadcast channel. Observers get a snapshot of the current
//! state followed by live events, and each holds its own cancellation token so
//! dropping out never touches the job or the other observers. Once a job is
//! terminal its final event stays available to late subscribers for a grace
//! window, then the entry is discarded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::article::Fingerprint;
use crate::error::JobFailure;
use crate::llm::ResultStatus;
use crate::storage::CompositeScore;

const MIN_CHANNEL_CAPACITY: usize = 16;
/// Events a job sends besides one per call: fetching, aggregating, storing, terminal.
const PHASE_EVENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Finer grained phase, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Queued,
    Fetching,
    Aggregating,
    Storing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveStatus {
    Pending,
    Valid,
    Invalid,
    Failed,
}

impl From<ResultStatus> for PerspectiveStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Valid => Self::Valid,
            ResultStatus::Invalid => Self::Invalid,
            ResultStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub job_id: Fingerprint,
    pub article_id: i64,
    pub status: JobStatus,
    pub step: JobStep,
    pub percent: u8,
    pub perspectives: BTreeMap<String, PerspectiveStatus>,
    pub message: String,
    pub last_updated: DateTime<Utc>,
}

impl ProgressState {
    pub fn queued<I, S>(job_id: Fingerprint, article_id: i64, perspective_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_id,
            article_id,
            status: JobStatus::Queued,
            step: JobStep::Queued,
            percent: 0,
            perspectives: perspective_ids
                .into_iter()
                .map(|id| (id.into(), PerspectiveStatus::Pending))
                .collect(),
            message: "Queued".to_string(),
            last_updated: Utc::now(),
        }
    }
}

/// What observers receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress(ProgressState),
    Completed(CompositeScore),
    Failed(JobFailure),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

struct JobChannel {
    sender: broadcast::Sender<ProgressEvent>,
    state: ProgressState,
    terminal: Option<ProgressEvent>,
    generation: u64,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<Fingerprint, JobChannel>,
    next_generation: u64,
}

/// Owned registry of job progress channels.
#[derive(Clone)]
pub struct ProgressManager {
    inner: Arc<Mutex<Registry>>,
    grace: Duration,
}

impl ProgressManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves only plain data behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a job that makes `calls` model calls. Replaces a finished
    /// entry still in its grace window.
    ///
    /// The channel holds every event the job can send, so an observer that
    /// subscribed at the start never lags however slowly it reads.
    pub fn begin(&self, state: ProgressState, calls: usize) {
        let mut reg = self.lock();
        reg.next_generation += 1;
        let generation = reg.next_generation;
        let capacity = (calls + PHASE_EVENTS).max(MIN_CHANNEL_CAPACITY);
        let (sender, _) = broadcast::channel(capacity);
        debug!(job = state.job_id.short(), generation, "progress tracking started");
        reg.jobs.insert(
            state.job_id.clone(),
            JobChannel {
                sender,
                state,
                terminal: None,
                generation,
            },
        );
    }

    /// Attach a new observer. The first events it sees are the current state
    /// and, for a finished job, the terminal event.
    pub fn subscribe(&self, job_id: &Fingerprint) -> Option<Subscription> {
        let reg = self.lock();
        let job = reg.jobs.get(job_id)?;
        let mut backlog = VecDeque::from([ProgressEvent::Progress(job.state.clone())]);
        if let Some(terminal) = &job.terminal {
            backlog.push_back(terminal.clone());
        }
        Some(Subscription {
            id: Uuid::new_v4(),
            job_id: job_id.clone(),
            backlog,
            receiver: job.sender.subscribe(),
            token: CancellationToken::new(),
            finished: false,
        })
    }

    /// Push a non-terminal state. Ignored once the job is terminal.
    pub fn publish(&self, state: ProgressState) {
        let mut reg = self.lock();
        let Some(job) = reg.jobs.get_mut(&state.job_id) else {
            warn!(job = state.job_id.short(), "progress published for unknown job");
            return;
        };
        if job.terminal.is_some() {
            return;
        }
        job.state = state.clone();
        // No receivers is fine; the state is still kept for the next subscriber.
        let _ = job.sender.send(ProgressEvent::Progress(state));
    }

    /// Finish a job with its score or failure, then schedule the entry for removal.
    pub fn complete(&self, job_id: &Fingerprint, outcome: Result<CompositeScore, JobFailure>) {
        let generation = {
            let mut reg = self.lock();
            let Some(job) = reg.jobs.get_mut(job_id) else {
                warn!(job = job_id.short(), "completion for unknown job");
                return;
            };
            if job.terminal.is_some() {
                return;
            }

            let event = match outcome {
                Ok(score) => {
                    job.state.status = JobStatus::Done;
                    job.state.step = JobStep::Complete;
                    job.state.percent = 100;
                    job.state.message = format!("Scored {:.3} (confidence {:.2})", score.score, score.confidence);
                    ProgressEvent::Completed(score)
                }
                Err(failure) => {
                    job.state.status = JobStatus::Error;
                    job.state.step = JobStep::Failed;
                    job.state.message = failure.message.clone();
                    ProgressEvent::Failed(failure)
                }
            };
            job.state.last_updated = Utc::now();
            job.terminal = Some(event.clone());
            let _ = job.sender.send(event);
            job.generation
        };

        let manager = self.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.grace).await;
            manager.discard(&job_id, generation);
        });
    }

    fn discard(&self, job_id: &Fingerprint, generation: u64) {
        let mut reg = self.lock();
        let current = reg
            .jobs
            .get(job_id)
            .map(|j| j.generation == generation && j.terminal.is_some())
            .unwrap_or(false);
        if current {
            reg.jobs.remove(job_id);
            debug!(job = job_id.short(), "progress state discarded");
        }
    }

    pub fn snapshot(&self, job_id: &Fingerprint) -> Option<ProgressState> {
        self.lock().jobs.get(job_id).map(|j| j.state.clone())
    }
}

/// One observer's view of a job.
pub struct Subscription {
    pub id: Uuid,
    pub job_id: Fingerprint,
    backlog: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    token: CancellationToken,
    finished: bool,
}

impl Subscription {
    /// Stream that yields a single `Completed` event, for results served from cache.
    pub fn completed(job_id: Fingerprint, score: CompositeScore) -> Self {
        let (_sender, receiver) = broadcast::channel(1);
        Self {
            id: Uuid::new_v4(),
            job_id,
            backlog: VecDeque::from([ProgressEvent::Completed(score)]),
            receiver,
            token: CancellationToken::new(),
            finished: false,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Next event, or `None` after the terminal event or cancellation.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished || self.token.is_cancelled() {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            self.finished = event.is_terminal();
            return Some(event);
        }
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(event) => {
                        self.finished = event.is_terminal();
                        return Some(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(job = self.job_id.short(), skipped, "observer lagged behind progress events");
                    }
                    Err(RecvError::Closed) => {
                        self.finished = true;
                        return None;
                    }
                },
            }
        }
    }

    /// Drain events until the job ends; returns the terminal event.
    pub async fn wait_terminal(&mut self) -> Option<ProgressEvent> {
        while let Some(event) = self.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::Article;
    use crate::error::RetryHint;
    use crate::perspectives::{ConfidenceMethod, Formula};

    fn job() -> (Fingerprint, ProgressState) {
        let fp = Article::new(1, "text").fingerprint("v1");
        let state = ProgressState::queued(fp.clone(), 1, ["left", "right"]);
        (fp, state)
    }

    fn score(fp: &Fingerprint) -> CompositeScore {
        CompositeScore {
            article_id: 1,
            fingerprint: fp.clone(),
            score: 0.25,
            confidence: 0.5,
            version: 1,
            formula: Formula::Weighted,
            confidence_method: ConfidenceMethod::Average,
            config_version: "v1".into(),
            valid_perspectives: 2,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn all_observers_see_updates_in_order() {
        let manager = ProgressManager::new(Duration::from_secs(60));
        let (fp, state) = job();
        manager.begin(state.clone(), 2);

        let mut a = manager.subscribe(&fp).expect("sub a");
        let mut b = manager.subscribe(&fp).expect("sub b");

        let mut half = state.clone();
        half.status = JobStatus::InProgress;
        half.percent = 50;
        manager.publish(half);
        manager.complete(&fp, Ok(score(&fp)));

        for sub in [&mut a, &mut b] {
            assert!(matches!(sub.recv().await, Some(ProgressEvent::Progress(s)) if s.percent == 0));
            assert!(matches!(sub.recv().await, Some(ProgressEvent::Progress(s)) if s.percent == 50));
            assert!(matches!(sub.recv().await, Some(ProgressEvent::Completed(c)) if c.version == 1));
            assert!(sub.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn cancelling_one_observer_leaves_the_other() {
        let manager = ProgressManager::new(Duration::from_secs(60));
        let (fp, state) = job();
        manager.begin(state.clone(), 2);

        let mut a = manager.subscribe(&fp).expect("sub a");
        let mut b = manager.subscribe(&fp).expect("sub b");
        a.recv().await;
        b.recv().await;

        a.cancel();
        assert!(a.recv().await.is_none());

        manager.complete(&fp, Ok(score(&fp)));
        assert!(matches!(b.recv().await, Some(ProgressEvent::Completed(_))));
    }

    #[tokio::test]
    async fn late_subscriber_gets_terminal_event_within_grace() {
        let manager = ProgressManager::new(Duration::from_secs(60));
        let (fp, state) = job();
        manager.begin(state, 2);
        manager.complete(
            &fp,
            Err(JobFailure {
                reason: "quorum_failure".into(),
                retry: RetryHint::RetryLater,
                message: "quorum not reached".into(),
            }),
        );

        let mut late = manager.subscribe(&fp).expect("still retained");
        let first = late.recv().await;
        assert!(matches!(first, Some(ProgressEvent::Progress(s)) if s.status == JobStatus::Error));
        let terminal = late.wait_terminal().await;
        assert!(matches!(terminal, Some(ProgressEvent::Failed(f)) if f.reason == "quorum_failure"));
    }

    #[tokio::test]
    async fn terminal_state_is_discarded_after_grace() {
        let manager = ProgressManager::new(Duration::from_millis(20));
        let (fp, state) = job();
        manager.begin(state, 2);
        manager.complete(&fp, Ok(score(&fp)));
        assert!(manager.snapshot(&fp).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.snapshot(&fp).is_none());
        assert!(manager.subscribe(&fp).is_none());
    }

    #[tokio::test]
    async fn terminal_state_is_absorbing() {
        let manager = ProgressManager::new(Duration::from_secs(60));
        let (fp, state) = job();
        manager.begin(state.clone(), 2);
        manager.complete(&fp, Ok(score(&fp)));
        manager.publish(state);

        let snap = manager.snapshot(&fp).expect("snapshot");
        assert_eq!(snap.status, JobStatus::Done);
        assert_eq!(snap.percent, 100);
    }

    #[tokio::test]
    async fn slow_observer_sees_every_event_of_a_large_job() {
        let manager = ProgressManager::new(Duration::from_secs(60));
        let (fp, state) = job();
        let calls = 200;
        manager.begin(state.clone(), calls);
        let mut sub = manager.subscribe(&fp).expect("observer");

        for n in 0..calls + PHASE_EVENTS - 1 {
            let mut update = state.clone();
            update.status = JobStatus::InProgress;
            update.message = format!("update {}", n);
            manager.publish(update);
        }
        manager.complete(&fp, Ok(score(&fp)));

        let mut updates = 0;
        let mut terminal = None;
        while let Some(event) = sub.recv().await {
            match event {
                ProgressEvent::Progress(_) => updates += 1,
                other => terminal = Some(other),
            }
        }
        // Snapshot from the backlog plus every published update.
        assert_eq!(updates, 1 + calls + PHASE_EVENTS - 1);
        assert!(matches!(terminal, Some(ProgressEvent::Completed(_))));
    }
}
