//! Command files: how `tqd` subcommands talk to a running daemon.
//!
//! Each command is one JSON file in `<state_dir>/commands/`, named
//! `<epoch nanos>-<sequence>-<uuid>.json` so that file-name order is
//! submission order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use transcode_queue::{JobId, JobSpec};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandAction {
    Add { spec: JobSpec },
    Cancel { job_id: JobId },
    Remove { job_id: JobId },
    Pause,
    Resume,
    Clear,
    SetMaxParallel { max_parallel_jobs: usize },
}

/// Command file format
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandFile {
    pub action: CommandAction,
    pub timestamp: DateTime<Utc>,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Drop a command for the daemon to pick up
pub fn submit(command_dir: &Path, action: CommandAction) -> Result<PathBuf> {
    fs::create_dir_all(command_dir)
        .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;

    let command = CommandFile { action, timestamp: Utc::now() };
    let nanos = command.timestamp.timestamp_nanos_opt().unwrap_or_default();
    let name = format!(
        "{:020}-{:06}-{}.json",
        nanos,
        SEQUENCE.fetch_add(1, Ordering::SeqCst),
        Uuid::new_v4().simple()
    );
    let path = command_dir.join(&name);
    // Not a .json name, so a concurrent drain never sees a half-written file
    let staging = command_dir.join(format!(".{}.part", name));

    let content = serde_json::to_vec_pretty(&command).context("Failed to encode command")?;
    fs::write(&staging, content)
        .with_context(|| format!("Failed to write command file: {}", staging.display()))?;
    fs::rename(&staging, &path)
        .with_context(|| format!("Failed to publish command file: {}", path.display()))?;

    debug!("Submitted command {}", path.display());
    Ok(path)
}

/// Read and delete every pending command, oldest first. Unparsable files are
/// deleted with a warning.
pub fn drain(command_dir: &Path) -> Result<Vec<CommandFile>> {
    if !command_dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(command_dir)
        .with_context(|| format!("Failed to read command directory: {}", command_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut commands = Vec::new();
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        match serde_json::from_str::<CommandFile>(&content) {
            Ok(command) => commands.push(command),
            Err(e) => warn!("Discarding invalid command file {}: {}", path.display(), e),
        }

        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to delete command file {}: {}", path.display(), e);
        }
    }

    Ok(commands)
}
