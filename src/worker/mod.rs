use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pipeline::delivery::{ReplyMessage, SharedReplyChannel};
use crate::pipeline::execution::{JobError, SharedJobProcessor};
use crate::pipeline::job::{Job, JobId, ModelId, ReplyTarget};
use crate::storage::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Dropped,
}

impl JobState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::{Done, Dropped, Failed, Queued, Running};

        matches!(
            (self, next),
            (Queued, Running) | (Queued, Dropped) | (Running, Done) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job: Job,
    state: JobState,
}

impl QueuedJob {
    fn transition(&mut self, next: JobState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            warn!(
                job_id = %self.job.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "ignoring invalid job state transition"
            );
        }
    }
}

/// The single line of pending work. It only exists while a job is pending or
/// running; the head is always the job being processed.
#[derive(Debug)]
pub struct QueueState {
    jobs: VecDeque<QueuedJob>,
    channel: ReplyTarget,
}

impl QueueState {
    fn new(first: Job) -> Self {
        let channel = first.reply_to.clone();
        let mut jobs = VecDeque::new();
        jobs.push_back(QueuedJob {
            job: first,
            state: JobState::Queued,
        });
        Self { jobs, channel }
    }

    /// Marks the head as running and hands out a copy for the pipeline to mutate.
    fn start_head(&mut self) -> Option<Job> {
        let head = self.jobs.front_mut()?;
        head.transition(JobState::Running);
        Some(head.job.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The queue was idle and the job is being processed right away.
    Started { job_id: JobId },
    /// The job waits behind others; `position` is 1-based and counts the running job.
    Queued { job_id: JobId, position: usize },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job_id } | Self::Queued { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJobView {
    pub id: JobId,
    pub image: String,
    pub model: ModelId,
    pub position: usize,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueSnapshot {
    pub active: bool,
    pub channel: Option<String>,
    pub jobs: Vec<QueuedJobView>,
}

struct QueueInner {
    state: Mutex<Option<QueueState>>,
    processor: SharedJobProcessor,
    workspace: Workspace,
    replies: SharedReplyChannel,
    active: watch::Sender<bool>,
}

/// Serial FIFO in front of the job processor. At most one job runs at a time;
/// the next one is only started after the previous one settled.
#[derive(Clone)]
pub struct UpscaleQueue {
    inner: Arc<QueueInner>,
}

impl UpscaleQueue {
    pub fn new(
        processor: SharedJobProcessor,
        workspace: Workspace,
        replies: SharedReplyChannel,
    ) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(None),
                processor,
                workspace,
                replies,
                active,
            }),
        }
    }

    /// Never waits on pipeline work. Must be called from within a tokio runtime
    /// since an idle queue spawns its drain task here.
    pub fn enqueue(&self, job: Job) -> EnqueueOutcome {
        let job_id = job.id;
        let mut guard = self.inner.lock_state();
        match guard.as_mut() {
            Some(queue) => {
                queue.jobs.push_back(QueuedJob {
                    job,
                    state: JobState::Queued,
                });
                let position = queue.jobs.len();
                info!(job_id = %job_id, position, "job added to queue");
                EnqueueOutcome::Queued { job_id, position }
            }
            None => {
                *guard = Some(QueueState::new(job));
                self.inner.active.send_replace(true);
                drop(guard);
                info!(job_id = %job_id, "queue idle, starting job");
                tokio::spawn(drain(self.inner.clone()));
                EnqueueOutcome::Started { job_id }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_state().is_some()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let guard = self.inner.lock_state();
        let Some(queue) = guard.as_ref() else {
            return QueueSnapshot::default();
        };
        QueueSnapshot {
            active: true,
            channel: Some(queue.channel.endpoint.clone()),
            jobs: queue
                .jobs
                .iter()
                .enumerate()
                .map(|(index, entry)| QueuedJobView {
                    id: entry.job.id,
                    image: entry.job.image.clone(),
                    model: entry.job.model.clone(),
                    position: index + 1,
                    state: entry.state,
                    enqueued_at: entry.job.enqueued_at,
                })
                .collect(),
        }
    }

    /// Resolves once no queue exists and any abort reply has been sent.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|active| !*active).await;
    }
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, Option<QueueState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops the finished head and starts the next job, or deletes the queue
    /// when nothing is left.
    fn advance(&self) -> Option<Job> {
        let mut guard = self.lock_state();
        let queue = guard.as_mut()?;
        if let Some(mut finished) = queue.jobs.pop_front() {
            finished.transition(JobState::Done);
        }
        match queue.start_head() {
            Some(next) => Some(next),
            None => {
                *guard = None;
                self.active.send_replace(false);
                info!("queue drained");
                None
            }
        }
    }

    /// Deletes the queue, dropping everything still pending, and tells the
    /// failed job's requester what went wrong.
    async fn abort(&self, failed: &Job, cause: JobError) {
        let deleted = self.lock_state().take();
        let mut dropped = Vec::new();
        if let Some(queue) = deleted {
            let mut entries = queue.jobs.into_iter();
            if let Some(mut head) = entries.next() {
                head.transition(JobState::Failed);
            }
            for mut entry in entries {
                entry.transition(JobState::Dropped);
                dropped.push(entry.job.id);
            }
        }
        error!(
            job_id = %failed.id,
            error_code = cause.code(),
            error = %cause,
            dropped = dropped.len(),
            "job failed, queue deleted"
        );

        let text = failed.reply_to.addressed(&failure_reply(&cause));
        if let Err(delivery) = self
            .replies
            .send(&failed.reply_to, ReplyMessage::text(text))
            .await
        {
            warn!(job_id = %failed.id, error = %delivery, "could not report job failure");
        }

        let guard = self.lock_state();
        if guard.is_none() {
            self.active.send_replace(false);
        }
    }
}

/// Runs queued jobs until the queue is deleted. The workspace is emptied
/// before each job starts; a job whose workspace cannot be emptied fails and
/// takes the rest of the queue with it.
async fn drain(inner: Arc<QueueInner>) {
    let mut cleared = inner.workspace.empty_dirs().await;
    let mut next = inner.lock_state().as_mut().and_then(QueueState::start_head);
    while let Some(mut job) = next.take() {
        if let Err(error) = cleared {
            inner.abort(&job, JobError::Workspace(error)).await;
            return;
        }
        match inner.processor.process(&mut job).await {
            Ok(outcome) => {
                info!(
                    job_id = %job.id,
                    stages = ?outcome.stages,
                    delivered = outcome.delivered,
                    "job completed"
                );
                cleared = inner.workspace.empty_dirs().await;
                next = inner.advance();
            }
            Err(cause) => {
                inner.abort(&job, cause).await;
                return;
            }
        }
    }
    if let Err(error) = cleared {
        warn!(error = %error, "failed to clear workspace after the last job");
    }
}

pub fn failure_reply(cause: &JobError) -> String {
    format!("Sorry, there was an error processing your image. {cause}")
}
