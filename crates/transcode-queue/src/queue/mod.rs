//! The scheduler: promotes queued jobs to workers, enforces the concurrency
//! limit, routes cancellation and publishes lifecycle events.
//!
//! Every store mutation, promotion decision and event emission happens under
//! one lock, which gives all subscribers a single global event order.

mod worker;


use std::collections::HashMap;
use std::sync::Arc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use crate::catalog::MediaCatalog;
use crate::events::{EventBus, QueueEvent, QueueListener};
use crate::finalize::{FileFinalizer, FileOps, FinalizePolicy, StdFileOps};
use crate::job::{Job, JobFailure, JobId, JobPatch, JobResult, JobSpec, JobStatus, ValidationError};
use crate::joblog::{JobLogError, JobLogs};
use crate::progress::TranscodeProgress;
use crate::store::{JobStore, StoreError};
use crate::transcoder::Transcoder;
use self::worker::WorkerOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_parallel_jobs: usize,
    /// Whether promotion is enabled when the queue is built
    pub auto_start: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 1,
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueConfigUpdate {
    pub max_parallel_jobs: Option<usize>,
    pub auto_start: Option<bool>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {status} and cannot be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// The job was queued and is now cancelled
    Cancelled,
    /// The job is running; `JobCancelled` follows once its process exits
    Cancelling,
}

struct ActiveJob {
    cancel: CancellationToken,
    cancel_requested: bool,
}

struct State {
    store: JobStore,
    config: QueueConfig,
    processing_enabled: bool,
    active: HashMap<JobId, ActiveJob>,
    /// Set once `QueueEmpty` has fired for the current drain
    idle: bool,
    shutting_down: bool,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    events: EventBus,
    transcoder: Arc<dyn Transcoder>,
    finalizer: Arc<FileFinalizer>,
    catalog: Option<Arc<dyn MediaCatalog>>,
    logs: Option<JobLogs>,
    drained: Notify,
}

/// Handle to a transcode queue. Clones share the same queue.
#[derive(Clone)]
pub struct TranscodeQueue {
    shared: Arc<Shared>,
}

pub struct TranscodeQueueBuilder {
    transcoder: Arc<dyn Transcoder>,
    store: JobStore,
    config: QueueConfig,
    finalize_policy: FinalizePolicy,
    file_ops: Arc<dyn FileOps>,
    catalog: Option<Arc<dyn MediaCatalog>>,
    logs: Option<JobLogs>,
}

impl TranscodeQueueBuilder {
    /// Jobs to start from; defaults to an empty in-memory store
    pub fn store(mut self, store: JobStore) -> Self {
        self.store = store;
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn finalize_policy(mut self, policy: FinalizePolicy) -> Self {
        self.finalize_policy = policy;
        self
    }

    pub fn file_ops(mut self, ops: Arc<dyn FileOps>) -> Self {
        self.file_ops = ops;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn MediaCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn job_logs(mut self, logs: JobLogs) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Build the queue. Nothing is started until the first call that
    /// promotes (`add_job`, `start_processing`, `force_process_queue`).
    pub fn build(self) -> Result<TranscodeQueue, QueueError> {
        validate_config(&self.config)?;
        let idle = self.store.count(JobStatus::Queued) == 0;
        let state = State {
            store: self.store,
            config: self.config,
            processing_enabled: self.config.auto_start,
            active: HashMap::new(),
            idle,
            shutting_down: false,
        };
        Ok(TranscodeQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                events: EventBus::new(),
                transcoder: self.transcoder,
                finalizer: Arc::new(FileFinalizer::with_file_ops(self.file_ops, self.finalize_policy)),
                catalog: self.catalog,
                logs: self.logs,
                drained: Notify::new(),
            }),
        })
    }
}

fn validate_config(config: &QueueConfig) -> Result<(), QueueError> {
    if config.max_parallel_jobs == 0 {
        return Err(QueueError::InvalidConfig("max_parallel_jobs must be at least 1".to_string()));
    }
    Ok(())
}

impl TranscodeQueue {
    pub fn builder(transcoder: Arc<dyn Transcoder>) -> TranscodeQueueBuilder {
        TranscodeQueueBuilder {
            transcoder,
            store: JobStore::in_memory(),
            config: QueueConfig::default(),
            finalize_policy: FinalizePolicy::default(),
            file_ops: Arc::new(StdFileOps),
            catalog: None,
            logs: None,
        }
    }

    /// Validate and enqueue a request, then try to start it
    pub fn add_job(&self, spec: JobSpec) -> Result<Job, QueueError> {
        spec.validate()?;

        let mut state = self.shared.state.lock();
        let job = state.store.add(spec).logged("adding a job");
        info!("Job {}: queued {} (priority {})", job.id, job.input_path.display(), job.priority);
        state.idle = false;
        self.shared.events.emit(QueueEvent::JobAdded(job.clone()));
        self.shared.promote(&mut state);
        Ok(job)
    }

    pub fn start_processing(&self) {
        let mut state = self.shared.state.lock();
        if !state.processing_enabled && !state.shutting_down {
            state.processing_enabled = true;
            info!("▶️  Queue processing started");
            self.shared.events.emit(QueueEvent::QueueStarted);
        }
        self.shared.promote(&mut state);
    }

    /// Stop promoting queued jobs. Running jobs continue.
    pub fn pause_processing(&self) {
        let mut state = self.shared.state.lock();
        if state.processing_enabled {
            state.processing_enabled = false;
            info!("⏸️  Queue processing paused");
            self.shared.events.emit(QueueEvent::QueuePaused);
        }
    }

    /// Run a promotion pass now
    pub fn force_process_queue(&self) {
        let mut state = self.shared.state.lock();
        self.shared.promote(&mut state);
    }

    /// Change limits at runtime. Raising the limit starts more jobs at once;
    /// lowering it lets running jobs finish. `auto_start` is stored only.
    pub fn update_config(&self, update: QueueConfigUpdate) -> Result<QueueConfig, QueueError> {
        let mut state = self.shared.state.lock();
        let mut config = state.config;
        if let Some(max) = update.max_parallel_jobs {
            config.max_parallel_jobs = max;
        }
        if let Some(auto_start) = update.auto_start {
            config.auto_start = auto_start;
        }
        validate_config(&config)?;

        if config != state.config {
            info!(
                "Queue config updated: max_parallel_jobs={}, auto_start={}",
                config.max_parallel_jobs, config.auto_start
            );
        }
        state.config = config;
        self.shared.promote(&mut state);
        Ok(config)
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.state.lock().config
    }

    /// Remove completed, failed and cancelled jobs; returns their ids
    pub fn clear_completed_and_failed_jobs(&self) -> Vec<JobId> {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.store.clear_terminal().logged("clearing history");
            if !removed.is_empty() {
                info!("Cleared {} finished job(s)", removed.len());
                self.shared.events.emit(QueueEvent::HistoryCleared { removed: removed.clone() });
            }
            removed
        };
        for id in &removed {
            self.shared.remove_log(id);
        }
        removed
    }

    /// Remove a queued or finished job. Returns false if the job does not
    /// exist or is still processing.
    pub fn remove_job(&self, id: &JobId) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.store.remove(id).logged("removing a job");
            if removed {
                info!("Job {}: removed", id);
                self.shared.events.emit(QueueEvent::JobRemoved(id.clone()));
                self.shared.check_idle(&mut state);
            } else if state.store.get(id).is_some() {
                debug!("Job {}: still processing, not removed", id);
            }
            removed
        };
        if removed {
            self.shared.remove_log(id);
        }
        removed
    }

    /// Cancel a queued job immediately, or ask a running job to stop
    pub fn cancel_job(&self, id: &JobId) -> Result<CancelState, QueueError> {
        let mut state = self.shared.state.lock();
        let status = state
            .store
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        match status {
            JobStatus::Queued => {
                let job = state
                    .store
                    .update_status(
                        id,
                        JobStatus::Cancelled,
                        JobPatch::finished(JobResult::Cancelled { reason: "cancelled before start".to_string() }),
                    )?
                    .logged("cancelling a job");
                info!("Job {}: cancelled before start", id);
                self.shared.events.emit(QueueEvent::JobCancelled(job));
                self.shared.check_idle(&mut state);
                Ok(CancelState::Cancelled)
            }
            JobStatus::Processing => {
                if let Some(active) = state.active.get_mut(id) {
                    active.cancel_requested = true;
                    active.cancel.cancel();
                }
                info!("Job {}: cancellation requested", id);
                Ok(CancelState::Cancelling)
            }
            status => Err(QueueError::NotCancellable { id: id.clone(), status }),
        }
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.shared.state.lock().store.get(id).cloned()
    }

    /// Snapshot of every job in insertion order
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.state.lock().store.list().to_vec()
    }

    pub fn is_processing_enabled(&self) -> bool {
        self.shared.state.lock().processing_enabled
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// True when nothing is running and nothing is waiting
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.active.is_empty() && state.store.count(JobStatus::Queued) == 0
    }

    /// Register the callback listener, replacing any previous one.
    /// Must be called from within a Tokio runtime.
    pub fn set_listener(&self, listener: Arc<dyn QueueListener>) {
        self.shared.events.set_listener(listener);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn read_job_log(&self, id: &JobId) -> Result<String, JobLogError> {
        match &self.shared.logs {
            Some(logs) => logs.read(id),
            None => Err(JobLogError::NotFound(id.clone())),
        }
    }

    /// Stop promoting, terminate every running process and wait for the
    /// workers to exit. Jobs interrupted this way stay `processing` in the
    /// snapshot and are requeued on the next start.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.processing_enabled = false;
            if !state.active.is_empty() {
                info!("🛑 Stopping {} running job(s)", state.active.len());
            }
            for active in state.active.values() {
                active.cancel.cancel();
            }
        }

        loop {
            let drained = self.shared.drained.notified();
            if self.shared.state.lock().active.is_empty() {
                break;
            }
            drained.await;
        }

        if let Err(e) = self.shared.state.lock().store.persist() {
            warn!("Final snapshot write failed: {}", e);
        }
        info!("Queue shut down");
    }
}

impl Shared {
    /// Start queued jobs until the limit is reached, then check for a drain
    fn promote(self: &Arc<Self>, state: &mut State) {
        if state.shutting_down {
            return;
        }

        while state.processing_enabled && state.active.len() < state.config.max_parallel_jobs {
            let id = match state.store.next_queued() {
                Some(job) => job.id.clone(),
                None => break,
            };
            let job = match state.store.update_status(&id, JobStatus::Processing, JobPatch::started_now()) {
                Ok(persisted) => persisted.logged("starting a job"),
                Err(e) => {
                    error!("Job {}: could not be started: {}", id, e);
                    break;
                }
            };

            let cancel = CancellationToken::new();
            state.active.insert(id.clone(), ActiveJob { cancel: cancel.clone(), cancel_requested: false });
            info!("🎬 Job {}: started ({} running)", id, state.active.len());
            self.events.emit(QueueEvent::JobStarted(job.clone()));
            worker::spawn(self.clone(), job, cancel);
        }

        self.check_idle(state);
    }

    fn check_idle(&self, state: &mut State) {
        if state.shutting_down || state.idle {
            return;
        }
        if state.active.is_empty() && state.store.count(JobStatus::Queued) == 0 {
            state.idle = true;
            info!("✅ Queue is empty");
            self.events.emit(QueueEvent::QueueEmpty);
        }
    }

    pub(crate) fn record_progress(&self, id: &JobId, progress: TranscodeProgress) {
        let mut state = self.state.lock();
        if state.store.update_progress(id, progress.clone()).is_ok() {
            self.events.emit(QueueEvent::JobProgress { id: id.clone(), progress });
        }
    }

    /// Record the single terminal outcome of a worker and promote the next job
    pub(crate) fn finish(self: &Arc<Self>, id: &JobId, outcome: WorkerOutcome) {
        let mut state = self.state.lock();
        let active = state.active.remove(id);

        let interrupted = state.shutting_down
            && matches!(outcome, WorkerOutcome::Cancelled)
            && !active.map(|a| a.cancel_requested).unwrap_or(false);
        if interrupted {
            info!("Job {}: interrupted by shutdown, left for the next start", id);
        } else {
            self.record_outcome(&mut state, id, outcome);
        }

        if state.active.is_empty() {
            self.drained.notify_waiters();
        }
        self.promote(&mut state);
    }

    fn record_outcome(&self, state: &mut State, id: &JobId, outcome: WorkerOutcome) {
        let (status, result) = match &outcome {
            WorkerOutcome::Completed(stats) => (JobStatus::Completed, JobResult::Success(stats.clone())),
            WorkerOutcome::Failed(failure) => (JobStatus::Failed, JobResult::Failure(failure.clone())),
            WorkerOutcome::Cancelled => (
                JobStatus::Cancelled,
                JobResult::Cancelled { reason: "cancelled while processing".to_string() },
            ),
        };

        let job = match state.store.update_status(id, status, JobPatch::finished(result)) {
            Ok(persisted) => persisted.logged("finishing a job"),
            Err(e) => {
                error!("Job {}: could not record outcome: {}", id, e);
                return;
            }
        };

        match outcome {
            WorkerOutcome::Completed(stats) => {
                info!(
                    "✅ Job {}: completed in {}s",
                    id,
                    job.duration().map(|d| d.num_seconds()).unwrap_or(0)
                );
                self.events.emit(QueueEvent::JobCompleted { job, stats });
            }
            WorkerOutcome::Failed(failure) => {
                log_failure(id, &failure);
                self.events.emit(QueueEvent::JobFailed { job, failure });
            }
            WorkerOutcome::Cancelled => {
                info!("Job {}: cancelled", id);
                self.events.emit(QueueEvent::JobCancelled(job));
            }
        }
    }

    fn remove_log(&self, id: &JobId) {
        if let Some(logs) = &self.logs {
            if let Err(e) = logs.remove(id) {
                warn!("Job {}: could not delete log: {}", id, e);
            }
        }
    }
}

fn log_failure(id: &JobId, failure: &JobFailure) {
    if failure.data_at_risk {
        error!("❌ Job {}: {} (DATA AT RISK)", id, failure);
    } else {
        warn!("❌ Job {}: {}", id, failure);
    }
}
