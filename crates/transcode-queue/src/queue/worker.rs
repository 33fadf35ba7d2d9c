use std::sync::Arc;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::catalog::CatalogUpdate;
use crate::job::{EncodeStats, FailureStage, Job, JobFailure};
use crate::transcoder::TranscodeOutcome;
use super::Shared;

/// Progress snapshots buffered between the transcoder and the worker
const PROGRESS_BUFFER: usize = 32;

#[derive(Debug)]
pub(crate) enum WorkerOutcome {
    Completed(EncodeStats),
    Failed(JobFailure),
    Cancelled,
}

/// Run `job` on its own task. A supervising task turns a crashed worker into
/// a failed job so the queue keeps moving.
pub(super) fn spawn(shared: Arc<Shared>, job: Job, cancel: CancellationToken) {
    let id = job.id.clone();
    let worker = tokio::spawn(run(shared.clone(), job, cancel));

    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!("Job {}: worker crashed: {}", id, e);
            let failure = JobFailure::new(FailureStage::Internal, format!("worker crashed: {}", e));
            shared.finish(&id, WorkerOutcome::Failed(failure));
        }
    });
}

async fn run(shared: Arc<Shared>, job: Job, cancel: CancellationToken) {
    let outcome = execute(&shared, &job, cancel).await;
    shared.finish(&job.id, outcome);
}

async fn execute(shared: &Arc<Shared>, job: &Job, cancel: CancellationToken) -> WorkerOutcome {
    let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BUFFER);

    let transcode = shared.transcoder.run(job, progress_tx, cancel.clone());
    tokio::pin!(transcode);

    // Progress is drained before the outcome so it is never reported late
    let result = loop {
        tokio::select! {
            biased;
            Some(progress) = progress_rx.recv() => shared.record_progress(&job.id, progress),
            result = &mut transcode => break result,
        }
    };
    while let Ok(progress) = progress_rx.try_recv() {
        shared.record_progress(&job.id, progress);
    }

    let stats = match result {
        Ok(TranscodeOutcome::Finished(stats)) => stats,
        Ok(TranscodeOutcome::Cancelled) => {
            discard_staging_output(job).await;
            return WorkerOutcome::Cancelled;
        }
        Err(e) => {
            discard_staging_output(job).await;
            return WorkerOutcome::Failed(JobFailure::new(e.stage(), e.to_string()));
        }
    };

    if cancel.is_cancelled() {
        discard_staging_output(job).await;
        return WorkerOutcome::Cancelled;
    }

    let finalizer = shared.finalizer.clone();
    let temp = job.output_path.clone();
    let destination = job.final_destination().to_path_buf();
    let is_overwrite = job.overwrite_input;
    let finalized = tokio::task::spawn_blocking(move || finalizer.finalize(&temp, &destination, is_overwrite)).await;

    let report = match finalized {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            let mut failure = JobFailure::new(FailureStage::Finalize, e.to_string());
            failure.data_at_risk = e.data_at_risk();
            return WorkerOutcome::Failed(failure);
        }
        Err(e) => {
            return WorkerOutcome::Failed(JobFailure::new(
                FailureStage::Internal,
                format!("finalization task crashed: {}", e),
            ));
        }
    };
    if !report.leftovers.is_empty() {
        warn!("Job {}: {} leftover file(s) need manual cleanup", job.id, report.leftovers.len());
    }

    if let Some(catalog) = shared.catalog.clone() {
        let update = CatalogUpdate::for_job(job, report.bytes);
        match tokio::task::spawn_blocking(move || catalog.record_processed(&update)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Job {}: catalog update failed: {:#}", job.id, e),
            Err(e) => warn!("Job {}: catalog update crashed: {}", job.id, e),
        }
    }

    WorkerOutcome::Completed(stats)
}

/// Delete a partial staging file. Only overwrite jobs own their output path.
async fn discard_staging_output(job: &Job) {
    if !job.overwrite_input {
        return;
    }
    match tokio::fs::remove_file(&job.output_path).await {
        Ok(()) => debug!("Job {}: removed partial output {}", job.id, job.output_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Job {}: could not remove partial output {}: {}", job.id, job.output_path.display(), e),
    }
}
