pub mod catalog;
pub mod config;
pub mod events;
pub mod finalize;
pub mod job;
pub mod joblog;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod snapshot;
pub mod store;
pub mod transcoder;

pub use catalog::{CatalogUpdate, JsonCatalog, MediaCatalog};
pub use config::DaemonConfig;
pub use events::{EventBus, QueueEvent, QueueListener};
pub use finalize::{FileFinalizer, FinalizeError, FinalizePolicy, FinalizeReport, Recovery};
pub use job::{EncodePreset, EncodeStats, Job, JobFailure, JobId, JobResult, JobSpec, JobStatus, ProbeSummary, TrackSelection};
pub use joblog::{JobLogError, JobLogs};
pub use progress::TranscodeProgress;
pub use queue::{CancelState, QueueConfig, QueueConfigUpdate, QueueError, TranscodeQueue};
pub use recovery::{recover_interrupted_finalizations, RecoveryAction};
pub use snapshot::SnapshotFile;
pub use store::JobStore;
pub use transcoder::{FfmpegRunner, TranscodeError, TranscodeOutcome, Transcoder};
