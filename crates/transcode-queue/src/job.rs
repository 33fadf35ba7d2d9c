use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use crate::progress::TranscodeProgress;

/// Opaque, immutable job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// The complete transition table. Anything not listed here is rejected by
    /// the job store.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding parameters handed through to the transcoder untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePreset {
    pub name: String,
    /// Output options inserted between the stream maps and the output path
    #[serde(default)]
    pub args: Vec<String>,
    /// Codec the preset produces, recorded in the media catalog
    #[serde(default)]
    pub video_codec: Option<String>,
}

impl Default for EncodePreset {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            args: [
                "-c:v", "libsvtav1", "-crf", "30", "-preset", "8",
                "-c:a", "copy", "-c:s", "copy",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            video_codec: Some("av1".to_string()),
        }
    }
}

/// Which source tracks to keep. `None` keeps every track of that kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSelection {
    #[serde(default)]
    pub audio: Option<Vec<u32>>,
    #[serde(default)]
    pub subtitles: Option<Vec<u32>>,
}

/// Probe facts supplied by the producer alongside a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSummary {
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Size metrics of a successful encode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeStats {
    pub initial_size_mb: Option<f64>,
    pub final_size_mb: Option<f64>,
    pub reduction_percent: Option<f64>,
}

impl EncodeStats {
    pub fn from_sizes(initial_bytes: Option<u64>, final_bytes: Option<u64>) -> Self {
        let to_mb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
        let reduction_percent = match (initial_bytes, final_bytes) {
            (Some(initial), Some(fin)) if initial > 0 => {
                Some((initial as f64 - fin as f64) / initial as f64 * 100.0)
            }
            _ => None,
        };
        Self {
            initial_size_mb: initial_bytes.map(to_mb),
            final_size_mb: final_bytes.map(to_mb),
            reduction_percent,
        }
    }

    /// Stat both files; whichever size cannot be read is left unset
    pub fn measure(input: &Path, output: &Path) -> Self {
        let size = |p: &Path| std::fs::metadata(p).ok().map(|m| m.len());
        Self::from_sizes(size(input), size(output))
    }
}

/// Where in the pipeline a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The transcoder could not be started
    Spawn,
    /// The transcoder ran but did not produce a usable output
    Process,
    /// The output was produced but could not be installed over the original
    Finalize,
    /// The worker itself crashed
    Internal,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStage::Spawn => "spawn",
            FailureStage::Process => "process",
            FailureStage::Finalize => "finalize",
            FailureStage::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: FailureStage,
    pub message: String,
    /// Set when the destination may be left without either version of the file
    #[serde(default)]
    pub data_at_risk: bool,
}

impl JobFailure {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            data_at_risk: false,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.stage, self.message)
    }
}

/// Outcome attached to a job in a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobResult {
    Success(EncodeStats),
    Failure(JobFailure),
    Cancelled { reason: String },
}

impl JobResult {
    pub fn error(&self) -> Option<&str> {
        match self {
            JobResult::Failure(failure) => Some(&failure.message),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} path is empty")]
    EmptyPath(&'static str),
    #[error("{field} path must be absolute: {}", .path.display())]
    RelativePath { field: &'static str, path: PathBuf },
    #[error("input and output are the same file: {}", .0.display())]
    SamePath(PathBuf),
    #[error("input file does not exist: {}", .0.display())]
    InputMissing(PathBuf),
}

/// A transcode request as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub overwrite_input: bool,
    #[serde(default)]
    pub preset: EncodePreset,
    #[serde(default)]
    pub probe: Option<ProbeSummary>,
    #[serde(default)]
    pub tracks: TrackSelection,
    #[serde(default)]
    pub priority: i32,
}

impl JobSpec {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            overwrite_input: false,
            preset: EncodePreset::default(),
            probe: None,
            tracks: TrackSelection::default(),
            priority: 0,
        }
    }

    /// Replace the input with the output once the encode succeeds; the output
    /// path becomes a staging location
    pub fn overwriting_input(mut self) -> Self {
        self.overwrite_input = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_preset(mut self, preset: EncodePreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_probe(mut self, probe: ProbeSummary) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_tracks(mut self, tracks: TrackSelection) -> Self {
        self.tracks = tracks;
        self
    }

    /// Reject requests that could never run; performed before queueing
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, path) in [("input", &self.input_path), ("output", &self.output_path)] {
            if path.as_os_str().is_empty() {
                return Err(ValidationError::EmptyPath(field));
            }
            if !path.is_absolute() {
                return Err(ValidationError::RelativePath { field, path: path.clone() });
            }
        }
        if self.input_path == self.output_path {
            return Err(ValidationError::SamePath(self.input_path.clone()));
        }
        if !self.input_path.is_file() {
            return Err(ValidationError::InputMissing(self.input_path.clone()));
        }
        Ok(())
    }
}

/// One requested transcode with its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub overwrite_input: bool,
    #[serde(default)]
    pub preset: EncodePreset,
    #[serde(default)]
    pub probe: Option<ProbeSummary>,
    #[serde(default)]
    pub tracks: TrackSelection,
    #[serde(default)]
    pub priority: i32,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<TranscodeProgress>,
    #[serde(default)]
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: JobId::generate(),
            input_path: spec.input_path,
            output_path: spec.output_path,
            overwrite_input: spec.overwrite_input,
            preset: spec.preset,
            probe: spec.probe,
            tracks: spec.tracks,
            priority: spec.priority,
            status: JobStatus::Queued,
            progress: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Path the finished file must end up at
    pub fn final_destination(&self) -> &Path {
        if self.overwrite_input {
            &self.input_path
        } else {
            &self.output_path
        }
    }

    /// Wall-clock time between start and completion
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Partial field update applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub progress: Option<TranscodeProgress>,
    pub result: Option<JobResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn finished(result: JobResult) -> Self {
        Self {
            result: Some(result),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, job: &mut Job) {
        if let Some(progress) = self.progress {
            job.progress = Some(progress);
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let parsed: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("movie.mkv");
        std::fs::write(&input, b"data").unwrap();

        assert_eq!(
            JobSpec::new("", dir.path().join("out.mkv")).validate(),
            Err(ValidationError::EmptyPath("input"))
        );
        assert!(matches!(
            JobSpec::new("movie.mkv", dir.path().join("out.mkv")).validate(),
            Err(ValidationError::RelativePath { field: "input", .. })
        ));
        assert_eq!(
            JobSpec::new(&input, &input).validate(),
            Err(ValidationError::SamePath(input.clone()))
        );
        let missing = dir.path().join("missing.mkv");
        assert_eq!(
            JobSpec::new(&missing, dir.path().join("out.mkv")).validate(),
            Err(ValidationError::InputMissing(missing))
        );
        assert!(JobSpec::new(&input, dir.path().join("out.mkv")).validate().is_ok());
    }

    #[test]
    fn test_encode_stats_reduction() {
        let stats = EncodeStats::from_sizes(Some(200 * 1024 * 1024), Some(50 * 1024 * 1024));
        assert_eq!(stats.initial_size_mb, Some(200.0));
        assert_eq!(stats.final_size_mb, Some(50.0));
        assert_eq!(stats.reduction_percent, Some(75.0));

        let partial = EncodeStats::from_sizes(None, Some(1024));
        assert_eq!(partial.reduction_percent, None);
        assert!(partial.final_size_mb.is_some());
    }

    #[test]
    fn test_result_round_trips_with_tag() {
        let result = JobResult::Failure(JobFailure::new(FailureStage::Finalize, "copy failed"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["stage"], "finalize");
        let back: JobResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.error(), Some("copy failed"));
    }

    #[test]
    fn test_final_destination_follows_overwrite_flag() {
        let spec = JobSpec::new("/media/a.mkv", "/media/a.tmp.mkv");
        assert_eq!(Job::from_spec(spec.clone()).final_destination(), Path::new("/media/a.tmp.mkv"));
        assert_eq!(
            Job::from_spec(spec.overwriting_input()).final_destination(),
            Path::new("/media/a.mkv")
        );
    }

    proptest! {
        /// Terminal states have no way out and nothing returns to queued
        #[test]
        fn test_terminal_states_are_final(from in any_status(), to in any_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            prop_assert!(!from.can_transition_to(JobStatus::Queued));
            if from.can_transition_to(to) {
                prop_assert_ne!(from, to);
            }
        }
    }
}
