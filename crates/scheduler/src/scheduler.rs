//! Concurrency-bounded FIFO job scheduler.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use siterec_common::error::{SiterecError, SiterecResult};
use siterec_job_model::{Job, JobId, QueueStatus, RecordingOutput, RecordingRequest, RequestSpec};
use tokio::sync::watch;

use crate::runner::JobRunner;

#[derive(Debug)]
struct SchedulerState {
    next_id: JobId,
    queue: VecDeque<Job>,
    running: BTreeMap<JobId, Job>,
    completed: BTreeMap<JobId, Job>,
    failed: BTreeMap<JobId, Job>,
}

impl SchedulerState {
    fn find(&self, id: JobId) -> Option<&Job> {
        self.running
            .get(&id)
            .or_else(|| self.completed.get(&id))
            .or_else(|| self.failed.get(&id))
            .or_else(|| self.queue.iter().find(|job| job.id() == id))
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    runner: Arc<dyn JobRunner>,
    max_concurrent: usize,
    /// Bumped on every state change so waiters can re-check.
    generation: watch::Sender<u64>,
}

/// Owns every job and admits queued ones while fewer than N are capturing.
///
/// Cheap to clone; clones share the same state. Submitting requires a
/// running tokio runtime since admitted jobs are spawned onto it.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(runner: Arc<dyn JobRunner>, max_concurrent: usize) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    next_id: 1,
                    queue: VecDeque::new(),
                    running: BTreeMap::new(),
                    completed: BTreeMap::new(),
                    failed: BTreeMap::new(),
                }),
                runner,
                max_concurrent: max_concurrent.max(1),
                generation,
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Queue a validated request and return its id without waiting.
    pub fn submit(&self, request: RecordingRequest) -> JobId {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(Job::new(id, request));
            id
        };
        tracing::info!(job_id = id, "Job queued");
        self.advance();
        id
    }

    /// Validate a raw request and queue it. Fails only on request shape.
    pub fn submit_spec(&self, spec: RequestSpec) -> SiterecResult<JobId> {
        let request = RecordingRequest::from_spec(spec)?;
        Ok(self.submit(request))
    }

    /// Snapshot of one job.
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().find(id).cloned()
    }

    /// Every job in every state, most recent id first.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .queue
            .iter()
            .chain(state.running.values())
            .chain(state.completed.values())
            .chain(state.failed.values())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.id().cmp(&a.id()));
        jobs
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            queued: state.queue.len(),
            running: state.running.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Wait until the job reaches a terminal state. `None` for unknown ids.
    pub async fn wait_for(&self, id: JobId) -> Option<Job> {
        let mut changes = self.inner.generation.subscribe();
        loop {
            match self.job(id) {
                Some(job) if job.status().is_terminal() => return Some(job),
                Some(_) => {}
                None => return None,
            }
            if changes.changed().await.is_err() {
                return self.job(id);
            }
        }
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        let mut changes = self.inner.generation.subscribe();
        loop {
            let idle = self.lock().is_idle();
            if idle || changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Admit queued jobs while capacity allows.
    ///
    /// The capacity check and the move into `running` happen under one lock
    /// so concurrent completions cannot over-admit.
    fn advance(&self) {
        let admitted: Vec<(JobId, RecordingRequest)> = {
            let mut state = self.lock();
            let mut admitted = Vec::new();
            while state.running.len() < self.inner.max_concurrent {
                let Some(mut job) = state.queue.pop_front() else {
                    break;
                };
                if let Err(e) = job.begin_capture() {
                    tracing::error!(job_id = job.id(), error = %e, "Queued job in unexpected state");
                    continue;
                }
                admitted.push((job.id(), job.request().clone()));
                state.running.insert(job.id(), job);
            }
            admitted
        };

        for (id, request) in admitted {
            tracing::info!(job_id = id, "Job admitted");
            self.spawn_job(id, request);
        }
        self.notify();
    }

    fn spawn_job(&self, id: JobId, request: RecordingRequest) {
        let scheduler = self.clone();
        let runner = Arc::clone(&self.inner.runner);
        tokio::spawn(async move {
            // The inner task isolates panics in the runner from the scheduler.
            let pipeline = tokio::spawn(async move { runner.run(id, &request).await });
            let result = match pipeline.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(SiterecError::Other(anyhow::anyhow!(
                    "recording pipeline panicked"
                ))),
                Err(e) => Err(SiterecError::Other(anyhow::anyhow!(
                    "recording pipeline aborted: {e}"
                ))),
            };
            scheduler.finish(id, result);
        });
    }

    fn finish(&self, id: JobId, result: SiterecResult<RecordingOutput>) {
        {
            let mut state = self.lock();
            let Some(mut job) = state.running.remove(&id) else {
                tracing::error!(job_id = id, "Finished job was not running");
                return;
            };
            match result {
                Ok(output) => {
                    tracing::info!(
                        job_id = id,
                        output = %output.path.display(),
                        size_bytes = output.size_bytes,
                        "Job completed"
                    );
                    if let Err(e) = job.complete(output) {
                        tracing::error!(job_id = id, error = %e, "Job state transition failed");
                    }
                    state.completed.insert(id, job);
                }
                Err(err) => {
                    tracing::error!(job_id = id, error = %err, "Job failed");
                    if let Err(e) = job.fail(err.to_string()) {
                        tracing::error!(job_id = id, error = %e, "Job state transition failed");
                    }
                    state.failed.insert(id, job);
                }
            }
        }
        self.advance();
    }

    fn notify(&self) {
        self.inner.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        // Critical sections only move whole jobs between collections.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use siterec_job_model::JobStatus;
    use std::path::PathBuf;

    struct ImmediateRunner;

    #[async_trait]
    impl JobRunner for ImmediateRunner {
        async fn run(
            &self,
            id: JobId,
            _request: &RecordingRequest,
        ) -> SiterecResult<RecordingOutput> {
            Ok(RecordingOutput {
                path: PathBuf::from(format!("/tmp/{id}.mp4")),
                file_name: format!("{id}.mp4"),
                size_bytes: 1,
                frames_received: 1,
                frames_forwarded: 1,
                frames_dropped: 0,
                navigation_completed: true,
            })
        }
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_without_consuming_an_id() {
        let scheduler = JobScheduler::new(Arc::new(ImmediateRunner), 2);
        let err = scheduler.submit_spec(RequestSpec::default()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: URL is required");

        let id = scheduler
            .submit_spec(RequestSpec::for_url("https://example.com"))
            .unwrap();
        assert_eq!(id, 1);
        let job = scheduler.wait_for(id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let scheduler = JobScheduler::new(Arc::new(ImmediateRunner), 1);
        assert!(scheduler.job(99).is_none());
        assert!(scheduler.wait_for(99).await.is_none());
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped() {
        let scheduler = JobScheduler::new(Arc::new(ImmediateRunner), 0);
        assert_eq!(scheduler.max_concurrent(), 1);
        let id = scheduler.submit(RecordingRequest::new("https://example.com").unwrap());
        assert!(scheduler.wait_for(id).await.unwrap().status().is_terminal());
    }
}
