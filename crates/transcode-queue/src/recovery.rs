//! Startup reconciliation of overwrite jobs that were interrupted while
//! their output was being installed over the original.

use std::fs;
use std::io;
use std::path::PathBuf;
use log::{info, warn};
use crate::finalize::{find_backups, find_backups_since};
use crate::job::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The newest backup of the interrupted run was moved back over the input
    Restored { job: JobId, backup: PathBuf, destination: PathBuf },
    /// Backups exist but none can be restored safely; left for the operator
    LeftForInspection { job: JobId, backups: Vec<PathBuf> },
    RestoreFailed { job: JobId, backup: PathBuf, error: String },
}

/// Look at every interrupted overwrite job for backups of its input.
///
/// `interrupted` holds the jobs as they were saved while `processing`. Only
/// backups stamped at or after the job's `started_at` belong to that run;
/// older ones are left alone. The newest backup of the run is restored when
/// the input is gone or the staging output is still present, since in both
/// cases the new file was never verified in place.
pub fn recover_interrupted_finalizations(interrupted: &[Job], backup_tag: &str) -> Vec<RecoveryAction> {
    let mut actions = Vec::new();

    for job in interrupted.iter().filter(|j| j.overwrite_input) {
        let input = &job.input_path;
        let backups = find_backups(input, backup_tag);
        if backups.is_empty() {
            continue;
        }

        let own = match job.started_at {
            Some(started) => find_backups_since(input, backup_tag, started.timestamp_millis()),
            None => Vec::new(),
        };
        let newest = match own.first() {
            Some(newest) => newest.clone(),
            None => {
                warn!(
                    "Job {}: {} has {} backup(s) older than the interrupted run; inspect them manually",
                    job.id,
                    input.display(),
                    backups.len()
                );
                actions.push(RecoveryAction::LeftForInspection { job: job.id.clone(), backups });
                continue;
            }
        };

        let input_missing = fs::symlink_metadata(input).is_err();
        let staging_left = job.output_path != *input && job.output_path.exists();

        if !input_missing && !staging_left {
            warn!(
                "Job {}: {} has {} backup(s) from an interrupted run; inspect them manually",
                job.id,
                input.display(),
                backups.len()
            );
            actions.push(RecoveryAction::LeftForInspection { job: job.id.clone(), backups });
            continue;
        }

        let restored = (|| -> io::Result<()> {
            if !input_missing {
                fs::remove_file(input)?;
            }
            fs::rename(&newest, input)
        })();

        match restored {
            Ok(()) => {
                info!("Job {}: restored {} from {}", job.id, input.display(), newest.display());
                if backups.len() > 1 {
                    warn!("Job {}: {} other backup(s) of {} left in place", job.id, backups.len() - 1, input.display());
                }
                actions.push(RecoveryAction::Restored {
                    job: job.id.clone(),
                    backup: newest,
                    destination: input.clone(),
                });
            }
            Err(e) => {
                warn!("Job {}: could not restore {} from {}: {}", job.id, input.display(), newest.display(), e);
                actions.push(RecoveryAction::RestoreFailed {
                    job: job.id.clone(),
                    backup: newest,
                    error: e.to_string(),
                });
            }
        }
    }

    actions
}
