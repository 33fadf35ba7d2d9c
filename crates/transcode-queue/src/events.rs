//! Ordered fan-out of queue lifecycle notifications.
//!
//! The scheduler emits while it holds its state lock, so the order in which
//! events enter the per-subscriber channels is the order in which the state
//! changed. Delivery to the registered listener happens on its own task, which
//! keeps listener code from ever running under the scheduler lock.

use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::job::{EncodeStats, Job, JobFailure, JobId};
use crate::progress::TranscodeProgress;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobAdded(Job),
    JobStarted(Job),
    JobProgress { id: JobId, progress: TranscodeProgress },
    JobCompleted { job: Job, stats: EncodeStats },
    JobFailed { job: Job, failure: JobFailure },
    JobCancelled(Job),
    JobRemoved(JobId),
    /// Fires once each time the last queued or running job drains
    QueueEmpty,
    QueueStarted,
    QueuePaused,
    HistoryCleared { removed: Vec<JobId> },
}

impl QueueEvent {
    /// Id of the job this event concerns, if any
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueueEvent::JobAdded(job)
            | QueueEvent::JobStarted(job)
            | QueueEvent::JobCancelled(job)
            | QueueEvent::JobCompleted { job, .. }
            | QueueEvent::JobFailed { job, .. } => Some(&job.id),
            QueueEvent::JobProgress { id, .. } | QueueEvent::JobRemoved(id) => Some(id),
            _ => None,
        }
    }
}

/// Callback bundle for queue notifications. Every method defaults to doing
/// nothing, so implementors only override what they care about.
pub trait QueueListener: Send + Sync + 'static {
    fn on_job_added(&self, _job: &Job) {}
    fn on_job_started(&self, _job: &Job) {}
    fn on_job_progress(&self, _id: &JobId, _progress: &TranscodeProgress) {}
    fn on_job_completed(&self, _job: &Job, _stats: &EncodeStats) {}
    fn on_job_failed(&self, _job: &Job, _failure: &JobFailure) {}
    fn on_job_cancelled(&self, _job: &Job) {}
    fn on_job_removed(&self, _id: &JobId) {}
    fn on_queue_empty(&self) {}
    fn on_queue_started(&self) {}
    fn on_queue_paused(&self) {}
    fn on_history_cleared(&self, _removed: &[JobId]) {}
}

fn deliver(listener: &dyn QueueListener, event: &QueueEvent) {
    match event {
        QueueEvent::JobAdded(job) => listener.on_job_added(job),
        QueueEvent::JobStarted(job) => listener.on_job_started(job),
        QueueEvent::JobProgress { id, progress } => listener.on_job_progress(id, progress),
        QueueEvent::JobCompleted { job, stats } => listener.on_job_completed(job, stats),
        QueueEvent::JobFailed { job, failure } => listener.on_job_failed(job, failure),
        QueueEvent::JobCancelled(job) => listener.on_job_cancelled(job),
        QueueEvent::JobRemoved(id) => listener.on_job_removed(id),
        QueueEvent::QueueEmpty => listener.on_queue_empty(),
        QueueEvent::QueueStarted => listener.on_queue_started(),
        QueueEvent::QueuePaused => listener.on_queue_paused(),
        QueueEvent::HistoryCleared { removed } => listener.on_history_cleared(removed),
    }
}

struct ListenerSlot {
    tx: mpsc::UnboundedSender<QueueEvent>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BusInner {
    listener: Option<ListenerSlot>,
    subscribers: Vec<mpsc::UnboundedSender<QueueEvent>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: QueueEvent) {
        let mut inner = self.inner.lock();
        if let Some(slot) = &inner.listener {
            let _ = slot.tx.send(event.clone());
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Open an additional event stream. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// Register the callback listener, replacing any previous one. Events not
    /// yet delivered to the previous listener are discarded. Must be called
    /// from within a Tokio runtime.
    pub fn set_listener(&self, listener: Arc<dyn QueueListener>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(listener.as_ref(), &event);
            }
        });

        let previous = self.inner.lock().listener.replace(ListenerSlot { tx, task });
        if let Some(previous) = previous {
            debug!("Replacing queue listener");
            previous.task.abort();
        }
    }

    pub fn clear_listener(&self) {
        if let Some(previous) = self.inner.lock().listener.take() {
            previous.task.abort();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.clear_listener();
    }
}
