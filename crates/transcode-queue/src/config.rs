use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::finalize::FinalizePolicy;
use crate::job::EncodePreset;

/// Configuration for the transcode queue daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the queue snapshot, job logs, command drop box and catalog
    pub state_dir: PathBuf,
    /// ffmpeg binary used for every job
    pub transcoder_bin: PathBuf,
    /// Jobs allowed to run at the same time
    pub max_parallel_jobs: usize,
    /// Start promoting jobs as soon as the daemon is up
    pub auto_start: bool,
    /// Seconds between SIGTERM and a forced kill when cancelling
    pub cancel_grace_secs: u64,
    /// Seconds between scans of the command directory
    pub command_poll_secs: u64,
    pub finalize: FinalizePolicy,
    /// Named presets selectable from `tqd add --preset`
    pub presets: BTreeMap<String, EncodePreset>,
    /// Record finished files in `<state_dir>/catalog.json`
    pub catalog_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DaemonConfig {
    pub fn default_config() -> Self {
        Self {
            state_dir: PathBuf::from("/tmp/tqd-state"),
            transcoder_bin: PathBuf::from("ffmpeg"),
            max_parallel_jobs: 1,
            auto_start: true,
            cancel_grace_secs: 10,
            command_poll_secs: 2,
            finalize: FinalizePolicy::default(),
            presets: BTreeMap::new(),
            catalog_enabled: true,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            bail!("max_parallel_jobs must be at least 1");
        }
        if self.state_dir.as_os_str().is_empty() {
            bail!("state_dir must not be empty");
        }
        if self.finalize.backup_tag.is_empty() || self.finalize.backup_tag.contains(std::path::is_separator) {
            bail!("finalize.backup_tag must be a non-empty file name fragment");
        }
        Ok(())
    }

    /// Look up a preset by name; "default" falls back to the built-in preset
    pub fn preset(&self, name: &str) -> Option<EncodePreset> {
        match self.presets.get(name) {
            Some(preset) => Some(EncodePreset {
                name: name.to_string(),
                ..preset.clone()
            }),
            None if name == "default" => Some(EncodePreset::default()),
            None => None,
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn command_dir(&self) -> PathBuf {
        self.state_dir.join("commands")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.state_dir.join("catalog.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, DaemonConfig::default_config());
        assert_eq!(DaemonConfig::load_config(None).unwrap(), DaemonConfig::default_config());
    }

    #[test]
    fn test_toml_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tqd.toml");
        std::fs::write(
            &path,
            r#"
state_dir = "/var/lib/tqd"
max_parallel_jobs = 3

[finalize]
copy_attempts = 5

[presets.fast]
name = "ignored"
args = ["-c:v", "libsvtav1", "-preset", "12"]
video_codec = "av1"
"#,
        )
        .unwrap();

        let config = DaemonConfig::load_config(Some(&path)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/tqd"));
        assert_eq!(config.max_parallel_jobs, 3);
        assert_eq!(config.finalize.copy_attempts, 5);
        assert_eq!(config.finalize.retry_delay_ms, 500);
        assert!(config.auto_start);
        assert_eq!(config.snapshot_path(), PathBuf::from("/var/lib/tqd/queue.json"));

        let fast = config.preset("fast").unwrap();
        assert_eq!(fast.name, "fast");
        assert_eq!(fast.args.last().map(String::as_str), Some("12"));
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tqd.json");
        std::fs::write(&path, r#"{"transcoder_bin": "/opt/ffmpeg/bin/ffmpeg", "auto_start": false}"#).unwrap();

        let config = DaemonConfig::load_config(Some(&path)).unwrap();
        assert_eq!(config.transcoder_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert!(!config.auto_start);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tqd.json");
        std::fs::write(&path, r#"{"max_parallel_jobs": 0}"#).unwrap();
        assert!(DaemonConfig::load_config(Some(&path)).is_err());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(DaemonConfig::load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_builtin_default_preset() {
        let config = DaemonConfig::default_config();
        assert_eq!(config.preset("default"), Some(EncodePreset::default()));
        assert_eq!(config.preset("missing"), None);
    }
}
