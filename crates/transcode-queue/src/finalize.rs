//! Crash-safe installation of a finished transcode over its destination.
//!
//! Sequence: validate the temporary output, move any existing destination to
//! a timestamped backup, copy the output into place, verify the size, then
//! delete the output and the backup. A failed or short copy puts the backup
//! back. The temporary output is only deleted after a verified copy.

use std::fmt;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::snapshot::with_suffix;

/// Retry and naming knobs for finalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizePolicy {
    /// Copy attempts before the copy is declared failed
    pub copy_attempts: u32,
    /// Rename attempts when creating or restoring the backup
    pub backup_attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Backups are named `<destination>.<tag>-<epoch millis>`
    pub backup_tag: String,
}

impl Default for FinalizePolicy {
    fn default() -> Self {
        Self {
            copy_attempts: 3,
            backup_attempts: 3,
            retry_delay_ms: 500,
            backup_tag: "backup".to_string(),
        }
    }
}

impl FinalizePolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// File-system primitives used by the finalizer. The defaults go straight to
/// `std::fs`; tests override single operations to inject failures.
pub trait FileOps: Send + Sync {
    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {}

/// State of the destination after a failed finalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The backup was moved back; the destination holds its previous content
    Restored,
    /// Nothing existed at the destination beforehand and nothing is left there
    NothingToRestore,
    /// The destination existed but could not be backed up, so the failed copy
    /// may have damaged it
    NoBackup,
    /// The backup exists but could not be moved back over the destination
    RollbackFailed { backup: PathBuf, error: String },
}

impl Recovery {
    pub fn data_at_risk(&self) -> bool {
        matches!(self, Recovery::NoBackup | Recovery::RollbackFailed { .. })
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Restored => write!(f, "previous destination content restored"),
            Recovery::NothingToRestore => write!(f, "destination did not exist before"),
            Recovery::NoBackup => write!(
                f,
                "no backup could be made; destination may be damaged, inspect it manually"
            ),
            Recovery::RollbackFailed { backup, error } => write!(
                f,
                "restoring backup {} failed ({}); inspect the destination and the backup manually",
                backup.display(),
                error
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("{0} path is empty")]
    EmptyPath(&'static str),
    #[error("temporary output {} is not accessible: {source}", .path.display())]
    TempUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("temporary output {} is not a regular file", .0.display())]
    TempNotFile(PathBuf),
    #[error("temporary output {} is empty", .0.display())]
    TempEmpty(PathBuf),
    #[error(
        "copying {} to {} failed after {attempts} attempt(s): {source}; {recovery}",
        .temp.display(),
        .destination.display()
    )]
    CopyFailed {
        temp: PathBuf,
        destination: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
        recovery: Recovery,
    },
    #[error(
        "copy of {} to {} is incomplete ({actual} of {expected} bytes); {recovery}",
        .temp.display(),
        .destination.display()
    )]
    SizeMismatch {
        temp: PathBuf,
        destination: PathBuf,
        expected: u64,
        actual: u64,
        recovery: Recovery,
    },
}

impl FinalizeError {
    /// How the destination was left, for failures that got as far as copying
    pub fn recovery(&self) -> Option<&Recovery> {
        match self {
            FinalizeError::CopyFailed { recovery, .. } | FinalizeError::SizeMismatch { recovery, .. } => {
                Some(recovery)
            }
            _ => None,
        }
    }

    pub fn data_at_risk(&self) -> bool {
        self.recovery().map(Recovery::data_at_risk).unwrap_or(false)
    }
}

/// What a successful finalization did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub destination: PathBuf,
    /// Size of the installed file
    pub bytes: u64,
    /// Backup taken of the previous destination, if one was made
    pub backup: Option<PathBuf>,
    /// Files that should have been deleted but could not be
    pub leftovers: Vec<PathBuf>,
    /// Whether something existed at the destination beforehand
    pub replaced_existing: bool,
}

struct Exhausted {
    error: io::Error,
    attempts: u32,
}

pub struct FileFinalizer {
    ops: Arc<dyn FileOps>,
    policy: FinalizePolicy,
}

impl FileFinalizer {
    pub fn new(policy: FinalizePolicy) -> Self {
        Self::with_file_ops(Arc::new(StdFileOps), policy)
    }

    pub fn with_file_ops(ops: Arc<dyn FileOps>, policy: FinalizePolicy) -> Self {
        Self { ops, policy }
    }

    pub fn policy(&self) -> &FinalizePolicy {
        &self.policy
    }

    /// Install `temp` at `dest`. Blocking; run it off the async executor.
    ///
    /// On success the destination holds the new content and neither the
    /// temporary output nor the backup remain (unless listed in
    /// [`FinalizeReport::leftovers`]). On failure the error says how the
    /// destination was left.
    pub fn finalize(&self, temp: &Path, dest: &Path, is_overwrite: bool) -> Result<FinalizeReport, FinalizeError> {
        if temp.as_os_str().is_empty() {
            return Err(FinalizeError::EmptyPath("temporary output"));
        }
        if dest.as_os_str().is_empty() {
            return Err(FinalizeError::EmptyPath("destination"));
        }
        let expected = self.validate_temp(temp)?;

        if temp == dest {
            debug!("Output is already at its destination: {}", dest.display());
            return Ok(FinalizeReport {
                destination: dest.to_path_buf(),
                bytes: expected,
                backup: None,
                leftovers: Vec::new(),
                replaced_existing: false,
            });
        }

        let existed = self.ops.metadata(dest).is_ok();
        if is_overwrite && !existed {
            warn!("Original {} is missing; installing the new file without a backup", dest.display());
        }
        let backup = if existed { self.create_backup(dest) } else { None };

        if let Err(exhausted) = self.retry(self.policy.copy_attempts, "copy", || self.ops.copy(temp, dest)) {
            let recovery = self.rollback(dest, backup.as_deref(), existed);
            return Err(FinalizeError::CopyFailed {
                temp: temp.to_path_buf(),
                destination: dest.to_path_buf(),
                attempts: exhausted.attempts,
                source: exhausted.error,
                recovery,
            });
        }

        // Re-stat both sides; the temp size is re-read in case it changed
        let expected = self.ops.metadata(temp).map(|m| m.len()).unwrap_or(expected);
        let actual = match self.ops.metadata(dest) {
            Ok(meta) => meta.len(),
            Err(source) => {
                let recovery = self.rollback(dest, backup.as_deref(), existed);
                return Err(FinalizeError::CopyFailed {
                    temp: temp.to_path_buf(),
                    destination: dest.to_path_buf(),
                    attempts: 1,
                    source,
                    recovery,
                });
            }
        };
        if actual != expected {
            let recovery = self.rollback(dest, backup.as_deref(), existed);
            return Err(FinalizeError::SizeMismatch {
                temp: temp.to_path_buf(),
                destination: dest.to_path_buf(),
                expected,
                actual,
                recovery,
            });
        }

        let mut leftovers = Vec::new();
        if let Err(e) = self.ops.remove_file(temp) {
            warn!("Installed {} but could not delete temp output {}: {}", dest.display(), temp.display(), e);
            leftovers.push(temp.to_path_buf());
        }
        if let Some(backup) = &backup {
            if let Err(e) = self.ops.remove_file(backup) {
                warn!("Installed {} but could not delete backup {}: {}", dest.display(), backup.display(), e);
                leftovers.push(backup.clone());
            }
        }

        info!("Installed {} ({} bytes)", dest.display(), actual);
        Ok(FinalizeReport {
            destination: dest.to_path_buf(),
            bytes: actual,
            backup,
            leftovers,
            replaced_existing: existed,
        })
    }

    /// A backup name for `dest` that does not exist yet
    pub fn backup_path_for(&self, dest: &Path) -> PathBuf {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let candidate = with_suffix(dest, &format!(".{}-{}", self.policy.backup_tag, millis));
            if fs::symlink_metadata(&candidate).is_err() {
                return candidate;
            }
            millis += 1;
        }
    }

    fn validate_temp(&self, temp: &Path) -> Result<u64, FinalizeError> {
        let meta = self
            .ops
            .metadata(temp)
            .map_err(|source| FinalizeError::TempUnavailable { path: temp.to_path_buf(), source })?;
        if !meta.is_file() {
            return Err(FinalizeError::TempNotFile(temp.to_path_buf()));
        }
        if meta.len() == 0 {
            return Err(FinalizeError::TempEmpty(temp.to_path_buf()));
        }
        Ok(meta.len())
    }

    fn create_backup(&self, dest: &Path) -> Option<PathBuf> {
        let backup = self.backup_path_for(dest);
        match self.retry(self.policy.backup_attempts, "backup", || self.ops.rename(dest, &backup)) {
            Ok(()) => {
                debug!("Backed up {} to {}", dest.display(), backup.display());
                Some(backup)
            }
            Err(exhausted) => {
                warn!(
                    "Could not back up {} after {} attempt(s): {}; overwriting in place",
                    dest.display(),
                    exhausted.attempts,
                    exhausted.error
                );
                None
            }
        }
    }

    fn rollback(&self, dest: &Path, backup: Option<&Path>, existed: bool) -> Recovery {
        match backup {
            Some(backup) => {
                // rename over an existing file fails on some platforms
                if let Err(e) = self.ops.remove_file(dest) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove partial copy {}: {}", dest.display(), e);
                    }
                }
                match self.retry(self.policy.backup_attempts, "restore", || self.ops.rename(backup, dest)) {
                    Ok(()) => {
                        info!("Restored {} from {}", dest.display(), backup.display());
                        Recovery::Restored
                    }
                    Err(exhausted) => {
                        error!(
                            "Failed to restore {} from {}: {}. Both files need manual inspection",
                            dest.display(),
                            backup.display(),
                            exhausted.error
                        );
                        Recovery::RollbackFailed {
                            backup: backup.to_path_buf(),
                            error: exhausted.error.to_string(),
                        }
                    }
                }
            }
            None if existed => {
                error!("Copy to {} failed and no backup exists; the file may be damaged", dest.display());
                Recovery::NoBackup
            }
            None => {
                if let Err(e) = self.ops.remove_file(dest) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove partial copy {}: {}", dest.display(), e);
                    }
                }
                Recovery::NothingToRestore
            }
        }
    }

    fn retry<T>(&self, attempts: u32, what: &str, mut op: impl FnMut() -> io::Result<T>) -> Result<T, Exhausted> {
        let attempts = attempts.max(1);
        let delay = self.policy.retry_delay();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts => {
                    warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt, attempts, error, delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(error) => return Err(Exhausted { error, attempts: attempt }),
            }
        }
    }
}

/// Backups of `dest` made with `tag`, newest first
pub fn find_backups(dest: &Path, tag: &str) -> Vec<PathBuf> {
    find_backups_since(dest, tag, i64::MIN)
}

/// Backups of `dest` stamped at or after `since_millis`, newest first
pub fn find_backups_since(dest: &Path, tag: &str, since_millis: i64) -> Vec<PathBuf> {
    let name = match dest.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Vec::new(),
    };
    let dir = match dest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let prefix = format!("{}.{}-", name, tag);
    let mut found: Vec<(i64, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let millis = file_name.to_str()?.strip_prefix(&prefix)?.parse::<i64>().ok()?;
            (millis >= since_millis).then(|| (millis, entry.path()))
        })
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, path)| path).collect()
}
