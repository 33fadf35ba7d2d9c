use log::{info, warn};
use thiserror::Error;
use crate::job::{Job, JobId, JobPatch, JobSpec, JobStatus};
use crate::progress::TranscodeProgress;
use crate::snapshot::{SnapshotError, SnapshotFile};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: JobId, from: JobStatus, to: JobStatus },
}

/// The value of a mutating store call together with the outcome of writing
/// the snapshot. A failed write does not undo the in-memory change.
#[derive(Debug)]
#[must_use = "persistence failures should be logged or surfaced"]
pub struct Persisted<T> {
    pub value: T,
    pub persist_error: Option<SnapshotError>,
}

impl<T> Persisted<T> {
    /// Log a failed write and return the value
    pub fn logged(self, what: &str) -> T {
        if let Some(e) = &self.persist_error {
            warn!("Snapshot write after {} failed; keeping in-memory state: {}", what, e);
        }
        self.value
    }
}

/// Ordered, in-memory collection of jobs mirrored to an optional snapshot
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Vec<Job>,
    snapshot: Option<SnapshotFile>,
}

impl JobStore {
    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the snapshot and rehydrate it. Jobs that were `processing` when
    /// the previous process stopped go back to `queued`. They are also
    /// returned as they were saved, `started_at` included, so the caller can
    /// reconcile any interrupted finalization.
    pub fn open(snapshot: SnapshotFile) -> Result<(Self, Vec<Job>), SnapshotError> {
        let mut jobs = snapshot.load_or_quarantine()?;
        let mut rehydrated = Vec::new();

        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Processing) {
            rehydrated.push(job.clone());
            job.status = JobStatus::Queued;
            job.started_at = None;
            job.progress = None;
        }

        let store = Self { jobs, snapshot: Some(snapshot) };
        if !rehydrated.is_empty() {
            info!("Rehydrated {} interrupted job(s) as queued", rehydrated.len());
            if let Err(e) = store.persist() {
                warn!("Failed to rewrite snapshot after rehydration: {}", e);
            }
        }
        Ok((store, rehydrated))
    }

    pub fn add(&mut self, spec: JobSpec) -> Persisted<Job> {
        let job = Job::from_spec(spec);
        self.jobs.push(job.clone());
        self.persisted(job)
    }

    /// Remove a queued or finished job. Processing jobs must be cancelled first.
    pub fn remove(&mut self, id: &JobId) -> Persisted<bool> {
        let position = self
            .jobs
            .iter()
            .position(|j| &j.id == id && j.status != JobStatus::Processing);
        match position {
            Some(index) => {
                self.jobs.remove(index);
                self.persisted(true)
            }
            None => Persisted { value: false, persist_error: None },
        }
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    /// All jobs in insertion order
    pub fn list(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Apply a checked status transition plus a field patch
    pub fn update_status(
        &mut self,
        id: &JobId,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<Persisted<Job>, StoreError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        patch.apply(job);
        let updated = job.clone();
        Ok(self.persisted(updated))
    }

    /// Record progress of a processing job. Progress is not persisted.
    pub fn update_progress(&mut self, id: &JobId, progress: TranscodeProgress) -> Result<(), StoreError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.progress = Some(progress);
        Ok(())
    }

    /// Drop every completed, failed and cancelled job
    pub fn clear_terminal(&mut self) -> Persisted<Vec<JobId>> {
        let removed: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect();
        if removed.is_empty() {
            return Persisted { value: removed, persist_error: None };
        }
        self.jobs.retain(|j| !j.status.is_terminal());
        self.persisted(removed)
    }

    /// The queued job that should run next: highest priority first, then the
    /// oldest, then whichever was inserted first
    pub fn next_queued(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Queued)
            .min_by(|(ia, a), (ib, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(_, j)| j)
    }

    /// Write the snapshot, if this store has one
    pub fn persist(&self) -> Result<(), SnapshotError> {
        match &self.snapshot {
            Some(snapshot) => snapshot.save(&self.jobs),
            None => Ok(()),
        }
    }

    fn persisted<T>(&self, value: T) -> Persisted<T> {
        Persisted { value, persist_error: self.persist().err() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobResult, EncodeStats};
    use proptest::prelude::*;
    use std::time::Duration;

    fn spec(name: &str) -> JobSpec {
        JobSpec::new(format!("/media/{}.mkv", name), format!("/media/{}.av1.mkv", name))
    }

    fn complete(store: &mut JobStore, id: &JobId) {
        store
            .update_status(id, JobStatus::Processing, JobPatch::started_now())
            .unwrap()
            .logged("test");
        store
            .update_status(id, JobStatus::Completed, JobPatch::finished(JobResult::Success(EncodeStats::default())))
            .unwrap()
            .logged("test");
    }

    #[test]
    fn test_add_appends_queued_job() {
        let mut store = JobStore::in_memory();
        let a = store.add(spec("a").with_priority(3)).logged("add");
        let b = store.add(spec("b")).logged("add");

        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.priority, 3);
        assert_eq!(b.priority, 0);
        let ids: Vec<_> = store.list().iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id]);
        assert_eq!(store.get(&a.id), Some(&a));
    }

    #[test]
    fn test_remove_rejects_processing_job() {
        let mut store = JobStore::in_memory();
        let job = store.add(spec("a")).logged("add");
        store
            .update_status(&job.id, JobStatus::Processing, JobPatch::started_now())
            .unwrap()
            .logged("start");

        assert!(!store.remove(&job.id).logged("remove"));
        assert_eq!(store.len(), 1);
        assert!(!store.remove(&JobId::from("nope")).logged("remove"));
    }

    #[test]
    fn test_remove_queued_and_terminal_jobs() {
        let mut store = JobStore::in_memory();
        let queued = store.add(spec("a")).logged("add");
        let done = store.add(spec("b")).logged("add");
        complete(&mut store, &done.id);

        assert!(store.remove(&queued.id).logged("remove"));
        assert!(store.remove(&done.id).logged("remove"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut store = JobStore::in_memory();
        let job = store.add(spec("a")).logged("add");

        let err = store
            .update_status(&job.id, JobStatus::Completed, JobPatch::default())
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition { id: job.id.clone(), from: JobStatus::Queued, to: JobStatus::Completed }
        );
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_update_status_applies_patch() {
        let mut store = JobStore::in_memory();
        let job = store.add(spec("a")).logged("add");
        let started = store
            .update_status(&job.id, JobStatus::Processing, JobPatch::started_now())
            .unwrap()
            .logged("start");
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        let finished = store
            .update_status(
                &job.id,
                JobStatus::Cancelled,
                JobPatch::finished(JobResult::Cancelled { reason: "user".into() }),
            )
            .unwrap()
            .logged("cancel");
        assert!(finished.completed_at.is_some());
        assert_eq!(finished.result, Some(JobResult::Cancelled { reason: "user".into() }));
    }

    #[test]
    fn test_clear_terminal_keeps_queued() {
        let mut store = JobStore::in_memory();
        let a = store.add(spec("a")).logged("add");
        let b = store.add(spec("b")).logged("add");
        let c = store.add(spec("c")).logged("add");
        complete(&mut store, &a.id);
        complete(&mut store, &b.id);

        let removed = store.clear_terminal().logged("clear");
        assert_eq!(removed, vec![a.id, b.id]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.list()[0].id, c.id);
        assert_eq!(store.list()[0].status, JobStatus::Queued);
    }

    #[test]
    fn test_next_queued_prefers_priority_then_age() {
        let mut store = JobStore::in_memory();
        let low = store.add(spec("low").with_priority(5)).logged("add");
        let high = store.add(spec("high").with_priority(10)).logged("add");
        let high_later = store.add(spec("high2").with_priority(10)).logged("add");

        assert_eq!(store.next_queued().unwrap().id, high.id);
        complete(&mut store, &high.id);
        assert_eq!(store.next_queued().unwrap().id, high_later.id);
        complete(&mut store, &high_later.id);
        assert_eq!(store.next_queued().unwrap().id, low.id);
        complete(&mut store, &low.id);
        assert!(store.next_queued().is_none());
    }

    #[test]
    fn test_open_rehydrates_processing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("queue.json"));
        {
            let (mut store, _) = JobStore::open(snapshot.clone()).unwrap();
            let job = store.add(spec("a")).logged("add");
            store
                .update_status(&job.id, JobStatus::Processing, JobPatch::started_now())
                .unwrap()
                .logged("start");
            store
                .update_progress(
                    &job.id,
                    TranscodeProgress {
                        percent: 40.0,
                        fps: None,
                        elapsed_secs: 1.0,
                        frame: None,
                        total_frames: None,
                        out_time_secs: None,
                        speed: None,
                    },
                )
                .unwrap();
            store.add(spec("b")).logged("add");
        }

        let (store, rehydrated) = JobStore::open(snapshot.clone()).unwrap();
        assert_eq!(rehydrated.len(), 1);
        assert_eq!(rehydrated[0].status, JobStatus::Processing);
        assert!(rehydrated[0].started_at.is_some());
        let job = store.get(&rehydrated[0].id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.progress.is_none());
        assert_eq!(store.next_queued().unwrap().id, job.id);

        // the rewrite makes the rehydration durable
        assert_eq!(snapshot.load().unwrap()[0].status, JobStatus::Queued);
    }

    #[test]
    fn test_persist_error_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes every write fail
        let blocked = dir.path().join("queue.json");
        std::fs::create_dir_all(blocked.join("occupied")).unwrap();
        let mut store = JobStore { jobs: Vec::new(), snapshot: Some(SnapshotFile::new(&blocked)) };

        let added = store.add(spec("a"));
        assert!(added.persist_error.is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&added.value.id).unwrap().status, JobStatus::Queued);
    }

    proptest! {
        /// Whatever the priorities, the next job has the maximum priority and
        /// is the first inserted among equals
        #[test]
        fn test_next_queued_is_highest_priority_first_inserted(
            priorities in prop::collection::vec(-5i32..5, 1..20)
        ) {
            let mut store = JobStore::in_memory();
            for (i, p) in priorities.iter().enumerate() {
                store.add(spec(&i.to_string()).with_priority(*p)).logged("add");
            }
            let max = *priorities.iter().max().unwrap();
            let first_index = priorities.iter().position(|p| *p == max).unwrap();
            let next = store.next_queued().unwrap();
            prop_assert_eq!(next.priority, max);
            prop_assert_eq!(&next.id, &store.list()[first_index].id);
        }
    }

    #[test]
    fn test_progress_update_keeps_status() {
        let mut store = JobStore::in_memory();
        let job = store.add(spec("a")).logged("add");
        let progress = TranscodeProgress {
            percent: 12.5,
            fps: Some(30.0),
            elapsed_secs: Duration::from_secs(3).as_secs_f64(),
            frame: Some(125),
            total_frames: Some(1000),
            out_time_secs: None,
            speed: None,
        };
        store.update_progress(&job.id, progress.clone()).unwrap();
        let stored = store.get(&job.id).unwrap();
        assert_eq!(stored.progress.as_ref(), Some(&progress));
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(
            store.update_progress(&JobId::from("missing"), progress),
            Err(StoreError::NotFound(JobId::from("missing")))
        );
    }
}
