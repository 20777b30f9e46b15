use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use orbit_encode_core::delivery::HttpTransfer;
use orbit_encode_core::ffmpeg::{CancelFlag, ToolPaths};
use orbit_encode_core::status::{ChannelError, MessageHandle, StatusChannel};
use orbit_encode_core::{AppError, JobRequest, PipelineConfig, PipelineRun, RunPaths, RunSummary};

type SharedWriter = Arc<Mutex<io::Stdout>>;

#[derive(Debug, serde::Serialize)]
struct Event<'a> {
    event: &'a str,
    payload: Value,
}

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize event: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn emit_event(writer: &SharedWriter, event: &str, payload: Value) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, &Event { event, payload })
}

/// Status channel rendered as JSON lines on stdout for a supervising process.
struct JsonLineChannel {
    out: SharedWriter,
    next_id: AtomicU64,
}

impl JsonLineChannel {
    fn new(out: SharedWriter) -> Self {
        Self {
            out,
            next_id: AtomicU64::new(1),
        }
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        emit_event(&self.out, event, payload).map_err(|e| ChannelError::Failed(e.to_string()))
    }
}

#[async_trait]
impl StatusChannel for JsonLineChannel {
    async fn send_message(&self, text: &str) -> Result<MessageHandle, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.emit("status.send", json!({ "id": id, "text": text }))?;
        Ok(MessageHandle(id))
    }

    async fn edit_message(&self, handle: MessageHandle, text: &str) -> Result<(), ChannelError> {
        self.emit("status.edit", json!({ "id": handle.0, "text": text }))
    }

    async fn send_file(&self, path: &Path, caption: Option<&str>) -> Result<(), ChannelError> {
        if !path.exists() {
            return Err(ChannelError::Failed(format!("{} does not exist", path.display())));
        }
        self.emit(
            "status.file",
            json!({ "path": path.display().to_string(), "caption": caption }),
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// A `cancel` line on stdin raises the run's flag. Stdin closing does nothing.
fn spawn_cancel_watcher(cancel: CancelFlag, out: SharedWriter) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().eq_ignore_ascii_case("cancel") {
                log::info!(target: "orbit_encode::bin", "Cancel requested");
                cancel.cancel();
                let _ = emit_event(&out, "job.cancelRequested", json!({}));
            }
        }
    });
}

async fn run(out: SharedWriter) -> Result<RunSummary, AppError> {
    let request = JobRequest::from_env()?;
    let tools = ToolPaths::discover()?;
    let work_dir = std::env::current_dir()?;
    let paths = RunPaths {
        source: PathBuf::from(env_or("SOURCE_FILE", "source.mkv")),
        work_dir,
        log_name: env_or("LOG_FILE", "encode_log.txt"),
        screenshot_name: env_or("SCREENSHOT_FILE", "grid_preview.jpg"),
    };
    log::info!(
        target: "orbit_encode::bin",
        "Job: {} from {} (crf={:?} preset={:?} res={:?} grain={} audio={:?} quality={})",
        request.file_name,
        paths.source.display(),
        request.overrides.crf,
        request.overrides.preset,
        request.overrides.res,
        request.overrides.grain,
        request.overrides.audio_mode,
        request.run_quality
    );

    let channel = Arc::new(JsonLineChannel::new(out.clone()));
    let endpoint = Arc::new(HttpTransfer::from_env()?);
    let pipeline = PipelineRun::new(
        request,
        PipelineConfig::default(),
        tools,
        paths,
        channel,
        endpoint,
    );
    spawn_cancel_watcher(pipeline.cancel_flag(), out);
    pipeline.run().await
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let out: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!(target: "orbit_encode::bin", "Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(out.clone())) {
        Ok(summary) => {
            let payload = serde_json::to_value(&summary).unwrap_or(Value::Null);
            let _ = emit_event(&out, "job.result", payload);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let payload = serde_json::to_value(&e).unwrap_or(Value::Null);
            let _ = emit_event(&out, "job.error", payload);
            ExitCode::FAILURE
        }
    }
}
