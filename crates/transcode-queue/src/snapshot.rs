use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::job::Job;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct SnapshotDoc {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    jobs: &'a [Job],
}

/// The on-disk copy of the whole queue
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored jobs. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<Job>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting with an empty queue", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SnapshotError::Io { path: self.path.clone(), source });
            }
        };

        let doc: SnapshotDoc = serde_json::from_str(&content)
            .map_err(|source| SnapshotError::Parse { path: self.path.clone(), source })?;
        Ok(doc.jobs)
    }

    /// Like [`load`](Self::load), but an unparsable snapshot is renamed to
    /// `<snapshot>.corrupt-<millis>` and treated as empty so the daemon can
    /// still start without overwriting the evidence
    pub fn load_or_quarantine(&self) -> Result<Vec<Job>, SnapshotError> {
        match self.load() {
            Err(SnapshotError::Parse { path, source }) => {
                let aside = with_suffix(&path, &format!(".corrupt-{}", Utc::now().timestamp_millis()));
                warn!("Snapshot {} is unreadable ({}); moving it to {}", path.display(), source, aside.display());
                fs::rename(&path, &aside).map_err(|source| SnapshotError::Io { path, source })?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Rewrite the snapshot wholesale. The new content is written to a
    /// sibling temp file and renamed into place.
    pub fn save(&self, jobs: &[Job]) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(&SnapshotRef { jobs })?;
        write_atomically(&self.path, &bytes)
            .map_err(|source| SnapshotError::Io { path: self.path.clone(), source })
    }
}

/// Append `suffix` to the full file name (`a.mkv` + `.bak` = `a.mkv.bak`)
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a truncated file
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = with_suffix(path, ".tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobStatus};

    #[test]
    fn test_missing_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("queue.json"));
        assert!(snapshot.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("state").join("queue.json"));
        let jobs: Vec<Job> = (0..3)
            .map(|i| Job::from_spec(JobSpec::new(format!("/m/{}.mkv", i), format!("/m/{}.out.mkv", i))))
            .collect();

        snapshot.save(&jobs).unwrap();
        let loaded = snapshot.load().unwrap();

        assert_eq!(loaded, jobs);
        assert!(!with_suffix(snapshot.path(), ".tmp").exists());
    }

    #[test]
    fn test_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("queue.json"));
        let job = Job::from_spec(JobSpec::new("/m/a.mkv", "/m/b.mkv"));
        snapshot.save(std::slice::from_ref(&job)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(snapshot.path()).unwrap()).unwrap();
        assert_eq!(raw["jobs"][0]["id"], job.id.as_str());
        assert_eq!(raw["jobs"][0]["status"], "queued");
    }

    #[test]
    fn test_document_without_jobs_key_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, "{}").unwrap();
        assert!(SnapshotFile::new(&path).load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, "{\"jobs\": [").unwrap();
        let snapshot = SnapshotFile::new(&path);

        assert!(matches!(snapshot.load(), Err(SnapshotError::Parse { .. })));
        assert!(snapshot.load_or_quarantine().unwrap().is_empty());
        assert!(!path.exists());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("queue.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_save_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("queue.json"));
        let mut job = Job::from_spec(JobSpec::new("/m/a.mkv", "/m/b.mkv"));
        snapshot.save(std::slice::from_ref(&job)).unwrap();

        job.status = JobStatus::Processing;
        snapshot.save(std::slice::from_ref(&job)).unwrap();
        assert_eq!(snapshot.load().unwrap()[0].status, JobStatus::Processing);

        snapshot.save(&[]).unwrap();
        assert!(snapshot.load().unwrap().is_empty());
    }
}
