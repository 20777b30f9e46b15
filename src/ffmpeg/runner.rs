//! External tool process spawning and line streaming.
//!
//! Spawns a tool as a child process and drains stdout and stderr on two
//! independent tasks so neither pipe can fill and stall the child. Lines are
//! tee'd to the run log (when one is attached) before being handed to the
//! caller's [`LineSink`], so throttled or slow consumers never lose log output.
//! Cancellation is cooperative: the flag is checked on every stdout (progress)
//! line and the child is killed at that boundary.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use super::builder::format_args_for_display_multiline;
use crate::error::AppError;

/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Single-writer cancellation flag shared by every stage of one run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Append-only plain-text log of everything a tool printed.
///
/// Writes go through an async file handle so the stream readers never block
/// a runtime worker. Call [`RunLog::flush`] before handing the file to anyone.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<AsyncMutex<File>>,
}

impl RunLog {
    pub async fn open_append(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Arc::new(AsyncMutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&self, line: &str) {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(record.as_bytes()).await {
            log::warn!(
                target: "orbit_encode::ffmpeg::runner",
                "Failed to write run log {}: {}",
                self.path.display(),
                e
            );
        }
    }

    pub async fn flush(&self) {
        if let Err(e) = self.file.lock().await.flush().await {
            log::warn!(
                target: "orbit_encode::ffmpeg::runner",
                "Failed to flush run log {}: {}",
                self.path.display(),
                e
            );
        }
    }

    pub async fn read_to_string(&self) -> String {
        self.flush().await;
        tokio::fs::read_to_string(&self.path).await.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// Receives every line the child prints, in arrival order per stream.
#[async_trait]
pub trait LineSink: Send {
    async fn on_line(&mut self, source: StreamSource, line: &str);
}

/// Sink that ignores everything; for invocations where only the exit code matters.
pub struct DiscardLines;

#[async_trait]
impl LineSink for DiscardLines {
    async fn on_line(&mut self, _source: StreamSource, _line: &str) {}
}

/// One external tool invocation.
pub struct Invocation<'a> {
    pub program: &'a Path,
    pub args: Vec<String>,
    pub log: Option<&'a RunLog>,
    pub cancel: Option<&'a CancelFlag>,
    pub timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a Path, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            log: None,
            cancel: None,
            timeout: None,
        }
    }

    pub fn log(mut self, log: &'a RunLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn cancel(mut self, cancel: &'a CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal state of a tool that ran to exit.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stderr_tail: String,
}

impl RunOutcome {
    /// -1 when the child died from a signal.
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }
}

enum DriveEnd {
    Exhausted,
    Cancelled,
}

fn read_stream<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    source: StreamSource,
    tx: mpsc::UnboundedSender<(StreamSource, String)>,
    log: Option<RunLog>,
    tail: Option<Arc<Mutex<Vec<u8>>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(256);
        loop {
            line_buf.clear();
            match stream_reader.read_until(b'\n', &mut line_buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&line_buf)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            if let Some(ref log) = log {
                log.write_line(&line).await;
            }
            if let Some(ref buf) = tail {
                let mut guard = buf.lock();
                guard.extend_from_slice(line.as_bytes());
                guard.push(b'\n');
                if guard.len() > MAX_STDERR_BYTES {
                    let excess = guard.len() - MAX_STDERR_BYTES;
                    guard.drain(..excess);
                }
            }
            // Receiver gone means the caller stopped listening; keep draining the pipe.
            let _ = tx.send((source, line));
        }
    })
}

/// Run a tool to completion, streaming its output into `sink`.
///
/// Returns `Err(AppError::Aborted)` when the cancel flag was observed, and
/// `Err(FfmpegFailed { code: -1, .. })` when the tool could not start or timed out.
/// A non-zero exit is an `Ok` outcome; the caller decides what it means.
pub async fn run_tool(
    invocation: Invocation<'_>,
    sink: &mut dyn LineSink,
) -> Result<RunOutcome, AppError> {
    let Invocation {
        program,
        args,
        log,
        cancel,
        timeout,
    } = invocation;

    log::debug!(
        target: "orbit_encode::ffmpeg::runner",
        "Spawning {}:\n{}",
        program.display(),
        format_args_for_display_multiline(&args)
    );

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::ffmpeg_failed(-1, format!("Failed to spawn {}: {}", program.display(), e)))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill().await;
        return Err(AppError::ffmpeg_failed(-1, "Failed to capture tool output"));
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
    let stdout_handle = read_stream(stdout, StreamSource::Stdout, tx.clone(), log.cloned(), None);
    let stderr_handle = read_stream(
        stderr,
        StreamSource::Stderr,
        tx,
        log.cloned(),
        Some(Arc::clone(&stderr_buffer)),
    );

    let drive = async {
        while let Some((source, line)) = rx.recv().await {
            if source == StreamSource::Stdout && cancel.is_some_and(CancelFlag::is_cancelled) {
                return DriveEnd::Cancelled;
            }
            sink.on_line(source, &line).await;
        }
        DriveEnd::Exhausted
    };

    let end = match timeout {
        Some(limit) => match tokio::time::timeout(limit, drive).await {
            Ok(end) => Some(end),
            Err(_) => None,
        },
        None => Some(drive.await),
    };

    match end {
        Some(DriveEnd::Exhausted) => {}
        Some(DriveEnd::Cancelled) => {
            log::info!(
                target: "orbit_encode::ffmpeg::runner",
                "Cancel requested, terminating {}",
                program.display()
            );
            let _ = child.kill().await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(AppError::aborted());
        }
        None => {
            let limit = timeout.unwrap_or_default();
            log::warn!(
                target: "orbit_encode::ffmpeg::runner",
                "{} timed out after {:?}, killing",
                program.display(),
                limit
            );
            let _ = child.kill().await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(AppError::ffmpeg_failed(
                -1,
                format!("{} timed out after {:?}", program.display(), limit),
            ));
        }
    }

    let _ = stdout_handle.await;
    let _ = stderr_handle.await;
    let status = child.wait().await?;

    let stderr_bytes = stderr_buffer.lock().clone();
    let stderr_tail = String::from_utf8_lossy(&stderr_bytes).to_string();

    if status.success() {
        log::debug!(
            target: "orbit_encode::ffmpeg::runner",
            "{} completed successfully",
            program.display()
        );
    } else {
        let err_preview = stderr_tail
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .join("; ");
        log::warn!(
            target: "orbit_encode::ffmpeg::runner",
            "{} exited (code={:?}): {}",
            program.display(),
            status.code(),
            err_preview
        );
    }

    Ok(RunOutcome {
        exit_code: status.code(),
        success: status.success(),
        stderr_tail,
    })
}
