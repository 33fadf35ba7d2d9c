use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use crate::job::{EncodeStats, FailureStage, Job, JobId};
use crate::joblog::JobLogs;
use crate::progress::{ProgressParser, TranscodeProgress};

/// Lines of stderr kept for failure messages
const DIAGNOSTIC_TAIL: usize = 40;

pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    Finished(EncodeStats),
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transcoder exited with {}: {diagnostics}", exit_label(.code))]
    Exited { code: Option<i32>, diagnostics: String },
    #[error("transcoder exited cleanly but {} was not written", .0.display())]
    MissingOutput(PathBuf),
    #[error("transcoder I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TranscodeError {
    pub fn stage(&self) -> FailureStage {
        match self {
            TranscodeError::Spawn { .. } => FailureStage::Spawn,
            _ => FailureStage::Process,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Runs one encode for one job.
///
/// Implementations stream progress through `progress` in order and return
/// exactly one outcome. When `cancel` fires they stop the work and return
/// [`TranscodeOutcome::Cancelled`].
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        progress: mpsc::Sender<TranscodeProgress>,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutcome, TranscodeError>;
}

/// Build the ffmpeg argument list for `job`
pub fn build_encode_args(job: &Job) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-progress", "pipe:1", "-nostats"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.push("-i".to_string());
    args.push(job.input_path.to_string_lossy().to_string());

    // Keep everything unless the producer picked tracks
    match (&job.tracks.audio, &job.tracks.subtitles) {
        (None, None) => {
            args.push("-map".to_string());
            args.push("0".to_string());
        }
        (audio, subtitles) => {
            args.push("-map".to_string());
            args.push("0:v:0".to_string());
            push_track_maps(&mut args, "a", audio.as_deref());
            push_track_maps(&mut args, "s", subtitles.as_deref());
        }
    }

    args.extend(job.preset.args.iter().cloned());
    args.push(job.output_path.to_string_lossy().to_string());
    args
}

fn push_track_maps(args: &mut Vec<String>, kind: &str, selection: Option<&[u32]>) {
    match selection {
        None => {
            args.push("-map".to_string());
            args.push(format!("0:{}?", kind));
        }
        Some(indices) => {
            for index in indices {
                args.push("-map".to_string());
                args.push(format!("0:{}:{}?", kind, index));
            }
        }
    }
}

/// [`Transcoder`] backed by an ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    program: PathBuf,
    logs: Option<JobLogs>,
    grace: Duration,
}

impl FfmpegRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            logs: None,
            grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Append command lines and stderr to per-job logs
    pub fn with_logs(mut self, logs: JobLogs) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Time between SIGTERM and a forced kill
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn open_log(&self, id: &JobId, command_line: &str) -> Option<tokio::fs::File> {
        let logs = self.logs.as_ref()?;
        match logs.open_for_append(id).await {
            Ok(mut file) => {
                let header = format!("$ {}\n", command_line);
                if let Err(e) = file.write_all(header.as_bytes()).await {
                    warn!("Job {}: could not write log {}: {}", id, logs.path_for(id).display(), e);
                }
                Some(file)
            }
            Err(e) => {
                warn!("Job {}: could not open log {}: {}", id, logs.path_for(id).display(), e);
                None
            }
        }
    }

    /// SIGTERM, wait out the grace window, then kill
    async fn terminate(&self, child: &mut Child, id: &JobId) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        if send_sigterm(child) {
            match timeout(self.grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!("Job {}: transcoder still running {:?} after SIGTERM, killing it", id, self.grace),
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Job {}: failed to kill transcoder: {}", id, e);
        }
    }
}

/// Next `\n`-terminated line with invalid UTF-8 replaced. `None` at EOF.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = match child.id() {
        Some(pid) => pid,
        None => return false,
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

#[async_trait]
impl Transcoder for FfmpegRunner {
    async fn run(
        &self,
        job: &Job,
        progress: mpsc::Sender<TranscodeProgress>,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        let args = build_encode_args(job);
        let command_line = format!("{} {}", self.program.display(), args.join(" "));
        debug!("Job {}: executing {}", job.id, command_line);

        let mut log_file = self.open_log(&job.id, &command_line).await;

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn { program: self.program.clone(), source })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stderr was not captured"))?;

        let started = Instant::now();
        let (total_frames, duration_secs) = job
            .probe
            .as_ref()
            .map(|p| (p.total_frames, p.duration_secs))
            .unwrap_or((None, None));

        let stdout_task = tokio::spawn(async move {
            let mut parser = ProgressParser::new(total_frames, duration_secs);
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                match next_lossy_line(&mut reader, &mut buf).await {
                    Ok(Some(line)) => {
                        if let Some(snapshot) = parser.feed(&line, started.elapsed()) {
                            // a closed receiver only means nobody is watching
                            let _ = progress.send(snapshot).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Transcoder stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                let line = match next_lossy_line(&mut reader, &mut buf).await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Transcoder stderr read failed: {}", e);
                        break;
                    }
                };
                if let Some(file) = log_file.as_mut() {
                    let written = file.write_all(line.as_bytes()).await.and(file.write_all(b"\n").await);
                    if written.is_err() {
                        log_file = None;
                    }
                }
                if tail.len() == DIAGNOSTIC_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            if let Some(mut file) = log_file {
                let _ = file.flush().await;
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status?,
            None => {
                info!("Job {}: stopping transcoder", job.id);
                self.terminate(&mut child, &job.id).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Ok(TranscodeOutcome::Cancelled);
            }
        };

        let _ = stdout_task.await;
        let diagnostics = stderr_task.await.unwrap_or_default();

        // A cancel that lands while the process is exiting still wins
        if cancel.is_cancelled() {
            return Ok(TranscodeOutcome::Cancelled);
        }

        if !status.success() {
            return Err(TranscodeError::Exited { code: status.code(), diagnostics });
        }

        let output_bytes = match tokio::fs::metadata(&job.output_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(TranscodeError::MissingOutput(job.output_path.clone())),
        };
        let input_bytes = tokio::fs::metadata(&job.input_path).await.ok().map(|m| m.len());

        debug!("Job {}: transcoder finished in {:?}", job.id, started.elapsed());
        Ok(TranscodeOutcome::Finished(EncodeStats::from_sizes(input_bytes, Some(output_bytes))))
    }
}
