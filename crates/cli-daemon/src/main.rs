mod commands;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use transcode_queue::{
    recover_interrupted_finalizations, DaemonConfig, EncodeStats, FfmpegRunner, Job, JobFailure, JobId, JobLogs,
    JobSpec, JobStatus, JobStore, JsonCatalog, ProbeSummary, QueueConfig, QueueConfigUpdate, QueueListener,
    RecoveryAction, SnapshotFile, TrackSelection, TranscodeProgress, TranscodeQueue,
};
use crate::commands::CommandAction;

/// Transcode queue daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the queue until interrupted
    Run {
        /// Exit once nothing is queued or running
        #[arg(long)]
        exit_when_empty: bool,
    },
    /// Queue a file for transcoding
    Add {
        input: PathBuf,
        /// Output file; defaults to a staging file next to the input with --overwrite
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Replace the input with the result
        #[arg(long)]
        overwrite: bool,
        #[arg(short, long, default_value = "default")]
        preset: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Source duration in seconds, for progress
        #[arg(long)]
        duration: Option<f64>,
        /// Source frame count, for progress
        #[arg(long)]
        frames: Option<u64>,
        /// Audio track indices to keep (comma separated); all when omitted
        #[arg(long, value_delimiter = ',')]
        audio: Option<Vec<u32>>,
        /// Subtitle track indices to keep (comma separated); all when omitted
        #[arg(long, value_delimiter = ',')]
        subtitles: Option<Vec<u32>>,
    },
    /// Show the queue as last persisted
    List {
        #[arg(long)]
        json: bool,
    },
    Cancel { job_id: String },
    Remove { job_id: String },
    Pause,
    Resume,
    /// Remove completed, failed and cancelled jobs
    Clear,
    /// Print the transcoder log of a job
    Log { job_id: String },
    /// Change the number of jobs that may run at once
    SetParallel { max: usize },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = DaemonConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Commands::Run { exit_when_empty } => run_daemon(cfg, exit_when_empty).await,
        Commands::Add {
            input,
            output,
            overwrite,
            preset,
            priority,
            duration,
            frames,
            audio,
            subtitles,
        } => {
            let preset = cfg
                .preset(&preset)
                .with_context(|| format!("Unknown preset: {}", preset))?;
            let input = absolute(&input)?;
            let output = match output {
                Some(output) => absolute(&output)?,
                None if overwrite => staging_path_for(&input),
                None => bail!("--output is required unless --overwrite is given"),
            };

            let mut spec = JobSpec::new(input, output)
                .with_preset(preset)
                .with_priority(priority)
                .with_tracks(TrackSelection { audio, subtitles });
            if overwrite {
                spec = spec.overwriting_input();
            }
            if duration.is_some() || frames.is_some() {
                spec = spec.with_probe(ProbeSummary {
                    duration_secs: duration,
                    total_frames: frames,
                    ..ProbeSummary::default()
                });
            }
            spec.validate().context("Rejected job")?;

            submit(&cfg, CommandAction::Add { spec })
        }
        Commands::List { json } => list_jobs(&cfg, json),
        Commands::Cancel { job_id } => submit(&cfg, CommandAction::Cancel { job_id: JobId::from(job_id) }),
        Commands::Remove { job_id } => submit(&cfg, CommandAction::Remove { job_id: JobId::from(job_id) }),
        Commands::Pause => submit(&cfg, CommandAction::Pause),
        Commands::Resume => submit(&cfg, CommandAction::Resume),
        Commands::Clear => submit(&cfg, CommandAction::Clear),
        Commands::Log { job_id } => {
            let log = JobLogs::new(cfg.log_dir())
                .read(&JobId::from(job_id))
                .context("Failed to read job log")?;
            print!("{}", log);
            Ok(())
        }
        Commands::SetParallel { max } => {
            if max == 0 {
                bail!("max must be at least 1");
            }
            submit(&cfg, CommandAction::SetMaxParallel { max_parallel_jobs: max })
        }
    }
}

async fn run_daemon(cfg: DaemonConfig, exit_when_empty: bool) -> Result<()> {
    info!("Transcode queue daemon starting");
    info!("Configuration loaded:");
    info!("  State dir: {}", cfg.state_dir.display());
    info!("  Transcoder: {}", cfg.transcoder_bin.display());
    info!("  Max parallel jobs: {}", cfg.max_parallel_jobs);
    info!("  Auto start: {}", cfg.auto_start);
    info!("  Command poll: {}s", cfg.command_poll_secs);

    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("Failed to create state directory: {}", cfg.state_dir.display()))?;

    let (store, rehydrated) =
        JobStore::open(SnapshotFile::new(cfg.snapshot_path())).context("Failed to open queue snapshot")?;
    info!("Loaded {} job(s) from {}", store.len(), cfg.snapshot_path().display());

    info!("🔄 Starting recovery checks...");
    let actions = recover_interrupted_finalizations(&rehydrated, &cfg.finalize.backup_tag);
    let restored = actions
        .iter()
        .filter(|a| matches!(a, RecoveryAction::Restored { .. }))
        .count();
    if rehydrated.is_empty() && actions.is_empty() {
        info!("✅ Startup recovery complete: no interrupted jobs found");
    } else {
        info!(
            "✅ Startup recovery complete: {} job(s) requeued, {} original(s) restored, {} need inspection",
            rehydrated.len(),
            restored,
            actions.len() - restored
        );
    }

    let logs = JobLogs::new(cfg.log_dir());
    let runner = FfmpegRunner::new(&cfg.transcoder_bin)
        .with_logs(logs.clone())
        .with_grace(Duration::from_secs(cfg.cancel_grace_secs));

    let mut builder = TranscodeQueue::builder(Arc::new(runner))
        .store(store)
        .config(QueueConfig {
            max_parallel_jobs: cfg.max_parallel_jobs,
            auto_start: cfg.auto_start,
        })
        .finalize_policy(cfg.finalize.clone())
        .job_logs(logs);
    if cfg.catalog_enabled {
        builder = builder.catalog(Arc::new(JsonCatalog::new(cfg.catalog_path())));
    }
    let queue = builder.build().context("Failed to build queue")?;
    queue.set_listener(Arc::new(LogListener { backup_tag: cfg.finalize.backup_tag.clone() }));

    apply_pending_commands(&queue, &cfg);
    queue.force_process_queue();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut poll = tokio::time::interval(Duration::from_secs(cfg.command_poll_secs.max(1)));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = poll.tick() => {
                apply_pending_commands(&queue, &cfg);
                queue.force_process_queue();

                if exit_when_empty && queue.is_idle() {
                    info!("Queue is empty, exiting");
                    break;
                }
            }
        }
    }

    queue.shutdown().await;
    info!("Transcode queue daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn apply_pending_commands(queue: &TranscodeQueue, cfg: &DaemonConfig) {
    let pending = match commands::drain(&cfg.command_dir()) {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Failed to process command files: {:#}", e);
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    for command in &pending {
        apply_command(queue, &command.action);
    }
    info!("✅ Processed {} command file(s)", pending.len());
}

fn apply_command(queue: &TranscodeQueue, action: &CommandAction) {
    match action {
        CommandAction::Add { spec } => match queue.add_job(spec.clone()) {
            Ok(job) => debug!("Job {}: added from command file", job.id),
            Err(e) => warn!("Rejected job for {}: {}", spec.input_path.display(), e),
        },
        CommandAction::Cancel { job_id } => {
            if let Err(e) = queue.cancel_job(job_id) {
                warn!("Cancel failed: {}", e);
            }
        }
        CommandAction::Remove { job_id } => {
            if !queue.remove_job(job_id) {
                warn!("Job {}: not removed (missing or still processing)", job_id);
            }
        }
        CommandAction::Pause => queue.pause_processing(),
        CommandAction::Resume => queue.start_processing(),
        CommandAction::Clear => {
            queue.clear_completed_and_failed_jobs();
        }
        CommandAction::SetMaxParallel { max_parallel_jobs } => {
            let update = QueueConfigUpdate {
                max_parallel_jobs: Some(*max_parallel_jobs),
                ..QueueConfigUpdate::default()
            };
            if let Err(e) = queue.update_config(update) {
                warn!("Config update rejected: {}", e);
            }
        }
    }
}

fn submit(cfg: &DaemonConfig, action: CommandAction) -> Result<()> {
    let path = commands::submit(&cfg.command_dir(), action)?;
    println!("Submitted {}", path.display());
    Ok(())
}

fn list_jobs(cfg: &DaemonConfig, json: bool) -> Result<()> {
    let jobs = SnapshotFile::new(cfg.snapshot_path())
        .load()
        .context("Failed to read queue snapshot")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:>8}  {:>4}  {:>10}  INPUT", "ID", "STATUS", "DONE", "PRIO", "SIZE");
    for job in &jobs {
        println!(
            "{:<36}  {:<10}  {:>8}  {:>4}  {:>10}  {}",
            job.id.as_str(),
            job.status.as_str(),
            progress_label(job),
            job.priority,
            fs::metadata(job.final_destination())
                .map(|m| format_size(m.len(), DECIMAL))
                .unwrap_or_else(|_| "-".to_string()),
            job.input_path.display()
        );
        if let Some(error) = job.result.as_ref().and_then(|r| r.error()) {
            println!("{:<36}  ↳ {}", "", error);
        }
    }
    Ok(())
}

/// Live progress never reaches the snapshot, so a running job has no percentage
fn progress_label(job: &Job) -> &'static str {
    match job.status {
        JobStatus::Completed => "100%",
        JobStatus::Processing => "running",
        _ => "-",
    }
}

/// Staging file used for overwrite jobs: `<dir>/<stem>.tqtmp.<ext>`
fn staging_path_for(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}.tqtmp.{}", stem, ext.to_string_lossy()),
        None => format!("{}.tqtmp", stem),
    };
    input.with_file_name(name)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
    Ok(cwd.join(path))
}

fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

/// Logs the events the queue itself does not report
struct LogListener {
    backup_tag: String,
}

impl LogListener {
    fn data_at_risk_message(&self, job: &Job) -> String {
        let destination = job.final_destination().display();
        format!(
            "Job {}: {} may be damaged; check it and any {}.{}-* file",
            job.id, destination, destination, self.backup_tag
        )
    }
}

impl QueueListener for LogListener {
    fn on_job_progress(&self, id: &JobId, progress: &TranscodeProgress) {
        debug!(
            "Job {}: {:.1}% (fps {}, speed {})",
            id,
            progress.percent,
            progress.fps.map(|f| format!("{:.1}", f)).unwrap_or_else(|| "?".to_string()),
            progress.speed.map(|s| format!("{:.2}x", s)).unwrap_or_else(|| "?".to_string())
        );
    }

    fn on_job_completed(&self, job: &Job, stats: &EncodeStats) {
        let took = job.duration().map(format_duration).unwrap_or_else(|| "?".to_string());
        match (stats.initial_size_mb, stats.final_size_mb, stats.reduction_percent) {
            (Some(before), Some(after), Some(saved)) => info!(
                "Job {}: {:.1} MB -> {:.1} MB ({:.1}% smaller) in {}",
                job.id, before, after, saved, took
            ),
            _ => info!("Job {}: finished in {}", job.id, took),
        }
    }

    fn on_job_failed(&self, job: &Job, failure: &JobFailure) {
        if failure.data_at_risk {
            error!("{}", self.data_at_risk_message(job));
        }
    }

    fn on_history_cleared(&self, removed: &[JobId]) {
        debug!("History cleared: {:?}", removed);
    }
}
