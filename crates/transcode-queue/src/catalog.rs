use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::job::{Job, JobId};
use crate::snapshot::write_atomically;

/// Metadata written to the catalog once a file has been replaced
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogUpdate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub video_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub job_id: JobId,
}

impl CatalogUpdate {
    /// Describe the installed output of `job`, `bytes` long
    pub fn for_job(job: &Job, bytes: u64) -> Self {
        let probe = job.probe.as_ref();
        Self {
            path: job.final_destination().to_path_buf(),
            size_bytes: bytes,
            video_codec: job
                .preset
                .video_codec
                .clone()
                .or_else(|| probe.and_then(|p| p.video_codec.clone())),
            width: probe.and_then(|p| p.width),
            height: probe.and_then(|p| p.height),
            job_id: job.id.clone(),
        }
    }
}

/// Persistent record of media files, updated after each successful job
pub trait MediaCatalog: Send + Sync {
    fn record_processed(&self, update: &CatalogUpdate) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub processed_by_job: JobId,
    pub processed_at: DateTime<Utc>,
}

/// Catalog kept as a single JSON object keyed by file path
pub struct JsonCatalog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records; a missing file is an empty catalog
    pub fn load(&self) -> Result<BTreeMap<PathBuf, CatalogRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse catalog {}", self.path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read catalog {}", self.path.display())),
        }
    }

    pub fn get(&self, path: &Path) -> Result<Option<CatalogRecord>> {
        Ok(self.load()?.remove(path))
    }
}

impl MediaCatalog for JsonCatalog {
    fn record_processed(&self, update: &CatalogUpdate) -> Result<()> {
        let _guard = self.lock.lock();
        let mut records = self.load()?;
        records.insert(
            update.path.clone(),
            CatalogRecord {
                size_bytes: update.size_bytes,
                video_codec: update.video_codec.clone(),
                width: update.width,
                height: update.height,
                processed_by_job: update.job_id.clone(),
                processed_at: Utc::now(),
            },
        );

        let bytes = serde_json::to_vec_pretty(&records).context("Failed to encode catalog")?;
        write_atomically(&self.path, &bytes)
            .with_context(|| format!("Failed to write catalog {}", self.path.display()))?;
        debug!("Catalog updated for {}", update.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EncodePreset, JobSpec, ProbeSummary};

    fn finished_job() -> Job {
        let probe = ProbeSummary {
            duration_secs: Some(60.0),
            total_frames: Some(1440),
            video_codec: Some("h264".into()),
            width: Some(1920),
            height: Some(1080),
        };
        Job::from_spec(
            JobSpec::new("/media/show.mkv", "/media/show.tqtmp.mkv")
                .overwriting_input()
                .with_probe(probe),
        )
    }

    #[test]
    fn test_update_describes_final_destination() {
        let job = finished_job();
        let update = CatalogUpdate::for_job(&job, 1234);

        assert_eq!(update.path, PathBuf::from("/media/show.mkv"));
        assert_eq!(update.size_bytes, 1234);
        assert_eq!(update.video_codec.as_deref(), Some("av1"));
        assert_eq!((update.width, update.height), (Some(1920), Some(1080)));
        assert_eq!(update.job_id, job.id);
    }

    #[test]
    fn test_codec_falls_back_to_probe() {
        let mut job = finished_job();
        job.preset = EncodePreset { video_codec: None, ..EncodePreset::default() };
        assert_eq!(CatalogUpdate::for_job(&job, 1).video_codec.as_deref(), Some("h264"));
    }

    #[test]
    fn test_record_replaces_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));
        let job = finished_job();

        catalog.record_processed(&CatalogUpdate::for_job(&job, 1000)).unwrap();
        catalog.record_processed(&CatalogUpdate::for_job(&job, 900)).unwrap();

        let records = catalog.load().unwrap();
        assert_eq!(records.len(), 1);
        let record = catalog.get(Path::new("/media/show.mkv")).unwrap().unwrap();
        assert_eq!(record.size_bytes, 900);
        assert_eq!(record.processed_by_job, job.id);
    }

    #[test]
    fn test_corrupt_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, "not json").unwrap();
        let catalog = JsonCatalog::new(&path);

        assert!(catalog.record_processed(&CatalogUpdate::for_job(&finished_job(), 1)).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "not json");
    }
}
