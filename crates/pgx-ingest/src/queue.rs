//! Single-worker ingestion queue
//!
//! Jobs run strictly one at a time in insertion order. The queue is the only
//! place that knows about work not yet reflected in storage, so readers that
//! need the full picture of a user's subjects merge [`IngestQueue::pending_subjects`]
//! into what they read from storage.
//!
//! All queue state sits behind one mutex. The worker task is started by the
//! first enqueue that finds the queue idle and exits once the queue drains.

use chrono::Utc;
use pgx_common::{ErrorKind, IngestError, JobStatus, Stage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use crate::job::{Job, JobId, JobRequest, PendingSubject};
use crate::pipeline::{JobRunner, ProgressSink};

/// Bounds on the capacity of the finished-job broadcast channel
const MIN_EVENT_CAPACITY: usize = 16;
const MAX_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct QueueState {
    /// Queued jobs plus the running one at the front
    jobs: VecDeque<Job>,
    running: bool,
    /// Finished jobs, oldest first
    history: VecDeque<Job>,
}

struct Inner {
    state: Mutex<QueueState>,
    runner: Arc<dyn JobRunner>,
    finished: broadcast::Sender<Job>,
    idle: watch::Sender<bool>,
    history_limit: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the head job running and hand out a copy, or go idle
    fn start_head(&self) -> Option<Job> {
        let mut state = self.lock();
        match state.jobs.front_mut() {
            Some(head) => {
                head.transition(JobStatus::Running);
                head.started_at = Some(Utc::now());
                Some(head.clone())
            },
            None => {
                state.running = false;
                self.idle.send_replace(true);
                None
            },
        }
    }

    /// Pop the finished job and record it
    fn advance(&self, finished: Job) {
        {
            let mut state = self.lock();
            if let Some(pos) = state.jobs.iter().position(|j| j.id == finished.id) {
                state.jobs.remove(pos);
            }
            if self.history_limit > 0 {
                state.history.push_back(finished.clone());
                while state.history.len() > self.history_limit {
                    state.history.pop_front();
                }
            }
        }
        // No subscribers is fine
        let _ = self.finished.send(finished);
    }

    fn snapshot(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.iter().find(|j| j.id == id).cloned()
    }
}

/// Writes pipeline progress into the queue's copy of the running job
struct QueueProgress {
    inner: Arc<Inner>,
    id: JobId,
}

impl ProgressSink for QueueProgress {
    fn update(&self, job: &Job) {
        let mut state = self.inner.lock();
        if let Some(slot) = state.jobs.iter_mut().find(|j| j.id == self.id) {
            *slot = job.clone();
        }
    }
}

/// Error kind for a run that died in `stage`
fn failure_kind(stage: Stage) -> ErrorKind {
    match stage {
        Stage::LoadConfiguration | Stage::StatAnnotator => ErrorKind::Configuration,
        Stage::StatInput | Stage::SanitizeFilename => ErrorKind::Input,
        Stage::InvokeAnnotator | Stage::VerifyAnnotatorOutput => ErrorKind::Annotation,
        Stage::InvokeParser => ErrorKind::Parse,
        Stage::VerifyRecordCounts => ErrorKind::Consistency,
        Stage::CreateCollections
        | Stage::CreateIndexes
        | Stage::MarkSubjectsReady
        | Stage::Cleanup => ErrorKind::Storage,
    }
}

async fn drive(inner: Arc<Inner>) {
    while let Some(job) = inner.start_head() {
        let id = job.id;
        info!(job_id = %id, "Job started");

        let runner = Arc::clone(&inner.runner);
        let progress: Arc<dyn ProgressSink> = Arc::new(QueueProgress {
            inner: Arc::clone(&inner),
            id,
        });
        let run = tokio::spawn(async move { runner.run(job, progress).await });

        let finished = match run.await {
            Ok(job) => job,
            Err(e) => {
                let Some(mut job) = inner.snapshot(id) else {
                    error!(job_id = %id, "Job vanished from the queue after its run aborted: {}", e);
                    continue;
                };
                let stage = job.current_stage();
                error!(job_id = %id, stage = %stage, "Job run aborted: {}", e);

                inner.runner.recover(&mut job).await;
                job.error = Some(IngestError::new(
                    failure_kind(stage),
                    format!("run aborted during {}: {}", stage, e),
                ));
                job.transition(JobStatus::Failed);
                job.finished_at = Some(Utc::now());
                job
            },
        };

        info!(
            job_id = %id,
            status = %finished.status,
            "Job finished"
        );
        inner.advance(finished);
    }
}

/// Handle to the ingestion queue. Clones share the same queue.
#[derive(Clone)]
pub struct IngestQueue {
    inner: Arc<Inner>,
}

impl IngestQueue {
    pub fn new(runner: Arc<dyn JobRunner>, history_limit: usize) -> Self {
        let capacity = history_limit.clamp(MIN_EVENT_CAPACITY, MAX_EVENT_CAPACITY);
        let (finished, _) = broadcast::channel(capacity);
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                runner,
                finished,
                idle,
                history_limit,
            }),
        }
    }

    /// Validate and append a job; starts the worker if the queue was idle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobId, IngestError> {
        request.validate()?;
        let job = Job::from_request(request);
        let id = job.id;

        let start_worker = {
            let mut state = self.inner.lock();
            info!(
                job_id = %id,
                owner = %job.owner,
                subjects = job.subjects.len(),
                position = state.jobs.len(),
                "Job queued"
            );
            state.jobs.push_back(job);
            if state.running {
                false
            } else {
                state.running = true;
                self.inner.idle.send_replace(false);
                true
            }
        };

        if start_worker {
            tokio::spawn(drive(Arc::clone(&self.inner)));
        }
        Ok(id)
    }

    /// Snapshot of queued and running jobs in insertion order, taken now
    pub fn current_jobs(&self) -> Vec<Job> {
        self.inner.lock().jobs.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .jobs
            .iter()
            .any(|job| job.status == JobStatus::Running)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look a job up in the queue, then in the finished history
    pub fn get(&self, id: JobId) -> Option<Job> {
        let state = self.inner.lock();
        state
            .jobs
            .iter()
            .chain(state.history.iter().rev())
            .find(|job| job.id == id)
            .cloned()
    }

    /// Subjects of `owner` still waiting or loading, newest job first
    pub fn pending_subjects(&self, owner: &str) -> Vec<PendingSubject> {
        let state = self.inner.lock();
        state
            .jobs
            .iter()
            .rev()
            .filter(|job| job.owner == owner)
            .flat_map(|job| {
                job.subjects.iter().map(move |subject| PendingSubject {
                    subject: subject.clone(),
                    owner: job.owner.clone(),
                    job_id: job.id,
                    status: job.status,
                    enqueued_at: job.enqueued_at,
                })
            })
            .collect()
    }

    /// Whether a queued or running job already carries `subject_id`
    pub fn is_subject_pending(&self, subject_id: &str) -> bool {
        self.inner
            .lock()
            .jobs
            .iter()
            .any(|job| job.subjects.iter().any(|s| s.subject_id == subject_id))
    }

    /// Recently finished jobs, oldest first
    pub fn finished_jobs(&self) -> Vec<Job> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Every job that leaves the queue is sent here
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.inner.finished.subscribe()
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives as long as `self`
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Wait for job `id` to leave the queue and return its final state.
    ///
    /// Returns `None` for unknown ids and for finished jobs that already
    /// dropped out of the history.
    pub async fn wait_for(&self, id: JobId) -> Option<Job> {
        let mut finished = self.subscribe();
        {
            let state = self.inner.lock();
            if let Some(job) = state.history.iter().rev().find(|job| job.id == id) {
                return Some(job.clone());
            }
            if !state.jobs.iter().any(|job| job.id == id) {
                return None;
            }
        }

        loop {
            match finished.recv().await {
                Ok(job) if job.id == id => return Some(job),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let state = self.inner.lock();
                    if let Some(job) = state.history.iter().rev().find(|job| job.id == id) {
                        return Some(job.clone());
                    }
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
