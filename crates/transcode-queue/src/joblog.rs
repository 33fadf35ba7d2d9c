use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use crate::job::JobId;

#[derive(Debug, Error)]
pub enum JobLogError {
    #[error("no log recorded for job {0}")]
    NotFound(JobId),
    #[error("failed to read log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory of per-job transcoder diagnostics, one `<job id>.log` each
#[derive(Debug, Clone)]
pub struct JobLogs {
    dir: PathBuf,
}

impl JobLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    /// Open the log of a job for appending, creating the directory on demand
    pub async fn open_for_append(&self, id: &JobId) -> io::Result<File> {
        tokio::fs::create_dir_all(&self.dir).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(id))
            .await
    }

    pub fn read(&self, id: &JobId) -> Result<String, JobLogError> {
        let path = self.path_for(id);
        std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                JobLogError::NotFound(id.clone())
            } else {
                JobLogError::Io { path, source }
            }
        })
    }

    /// Delete the log of a job; a missing log is not an error
    pub fn remove(&self, id: &JobId) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
