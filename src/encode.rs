//! Encode supervision: run the encoder, turn its progress channel into
//! throttled status, classify the exit, and retry a bounded number of times.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::ffmpeg::progress::parse_out_time;
use crate::ffmpeg::{
    CancelFlag, Invocation, LineSink, MediaProfile, ProgressSample, RunLog, StreamSource,
    build_encode_args, format_args_for_display_multiline, log_tail, run_tool,
};
use crate::params::EncodeSettings;
use crate::status::{RunLabels, StatusReporter, StatusThrottle, render_encode_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl EncodeState {
    fn can_enter(self, next: EncodeState) -> bool {
        matches!(
            (self, next),
            (EncodeState::Starting, EncodeState::Running)
                | (EncodeState::Starting, EncodeState::Failed)
                | (EncodeState::Starting, EncodeState::Cancelled)
                | (EncodeState::Running, EncodeState::Succeeded)
                | (EncodeState::Running, EncodeState::Failed)
                | (EncodeState::Running, EncodeState::Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeResult {
    Success,
    Failed { exit_code: i32, log_tail: String },
    Cancelled,
}

impl EncodeResult {
    pub fn state(&self) -> EncodeState {
        match self {
            EncodeResult::Success => EncodeState::Succeeded,
            EncodeResult::Failed { .. } => EncodeState::Failed,
            EncodeResult::Cancelled => EncodeState::Cancelled,
        }
    }
}

/// Result of the supervised encode including retries.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutcome {
    pub result: EncodeResult,
    pub attempts: u32,
    /// Wall clock across all attempts.
    pub elapsed: Duration,
}

/// Inputs for one supervised encode.
pub struct EncodeJob<'a> {
    pub ffmpeg: &'a Path,
    pub source: &'a Path,
    pub output: &'a Path,
    pub settings: &'a EncodeSettings,
    pub profile: &'a MediaProfile,
    pub labels: &'a RunLabels,
    pub log: &'a RunLog,
    pub cancel: &'a CancelFlag,
    pub config: &'a PipelineConfig,
}

struct Supervisor {
    state: EncodeState,
}

impl Supervisor {
    fn advance(&mut self, next: EncodeState) {
        if self.state.can_enter(next) {
            log::debug!(
                target: "orbit_encode::encode",
                "{:?} -> {:?}",
                self.state,
                next
            );
            self.state = next;
        } else {
            log::warn!(
                target: "orbit_encode::encode",
                "Ignoring transition {:?} -> {:?}",
                self.state,
                next
            );
        }
    }
}

struct EncodeProgress<'a> {
    reporter: &'a mut StatusReporter,
    throttle: &'a mut StatusThrottle,
    labels: &'a RunLabels,
    output: &'a Path,
    duration: f64,
    total_frames: u64,
    started: Instant,
    latest: Option<ProgressSample>,
}

#[async_trait]
impl LineSink for EncodeProgress<'_> {
    async fn on_line(&mut self, source: StreamSource, line: &str) {
        if source != StreamSource::Stdout {
            return;
        }
        let Some(position) = parse_out_time(line) else {
            return;
        };
        let mut sample = ProgressSample::from_position(
            position,
            self.duration,
            self.total_frames,
            self.started.elapsed(),
            self.latest.map(|s| s.output_bytes).unwrap_or(0),
        );
        if self.throttle.is_open() {
            sample.output_bytes = tokio::fs::metadata(self.output)
                .await
                .map(|m| m.len())
                .unwrap_or(sample.output_bytes);
            self.latest = Some(sample);
            let text = render_encode_status(self.labels, &sample, self.duration);
            self.throttle.mark();
            self.reporter.update(&text).await;
        } else {
            self.latest = Some(sample);
        }
    }
}

/// One encoder attempt. Output is appended to the job's log.
///
/// `throttle` spaces status writes for the whole encode stage, so callers
/// share one across attempts.
pub async fn run_encode(
    job: &EncodeJob<'_>,
    reporter: &mut StatusReporter,
    throttle: &mut StatusThrottle,
) -> EncodeResult {
    let mut supervisor = Supervisor {
        state: EncodeState::Starting,
    };
    let args = build_encode_args(job.source, job.output, job.settings);
    log::debug!(
        target: "orbit_encode::encode",
        "ffmpeg\n{}",
        format_args_for_display_multiline(&args)
    );

    let mut progress = EncodeProgress {
        reporter,
        throttle,
        labels: job.labels,
        output: job.output,
        duration: job.profile.duration,
        total_frames: job.profile.frame_count,
        started: Instant::now(),
        latest: None,
    };
    supervisor.advance(EncodeState::Running);
    let outcome = run_tool(
        Invocation::new(job.ffmpeg, args)
            .log(job.log)
            .cancel(job.cancel),
        &mut progress,
    )
    .await;

    let result = match outcome {
        Ok(o) if o.success => EncodeResult::Success,
        Ok(o) => EncodeResult::Failed {
            exit_code: o.code(),
            log_tail: log_tail(&job.log.read_to_string().await, job.config.log_tail_lines),
        },
        Err(e) if e.is_cancellation() => EncodeResult::Cancelled,
        Err(AppError::FfmpegFailed { code, stderr }) => {
            job.log.write_line(&stderr).await;
            EncodeResult::Failed {
                exit_code: code,
                log_tail: log_tail(&job.log.read_to_string().await, job.config.log_tail_lines),
            }
        }
        Err(e) => {
            job.log.write_line(&e.to_string()).await;
            EncodeResult::Failed {
                exit_code: -1,
                log_tail: e.to_string(),
            }
        }
    };
    supervisor.advance(result.state());
    result
}

/// Run the encoder, re-running it after a non-zero exit up to the configured
/// retry count. Cancellation is never retried and discards partial output.
/// Every encode-stage status write, the retry notice included, shares one
/// throttle window.
pub async fn run_encode_with_retry(
    job: &EncodeJob<'_>,
    reporter: &mut StatusReporter,
) -> EncodeOutcome {
    let started = Instant::now();
    let max_attempts = job.config.encode_retries + 1;
    let mut throttle = StatusThrottle::new(job.config.encode_status_interval());
    let mut attempt = 0;
    loop {
        attempt += 1;
        job.log
            .write_line(&format!(
                "===== encode attempt {}/{} =====",
                attempt, max_attempts
            ))
            .await;
        log::info!(
            target: "orbit_encode::encode",
            "Encode attempt {}/{}: crf={} preset={}",
            attempt,
            max_attempts,
            job.settings.crf,
            job.settings.preset
        );

        let mut result = run_encode(job, reporter, &mut throttle).await;
        match &result {
            EncodeResult::Failed { exit_code, .. }
                if attempt < max_attempts && !job.cancel.is_cancelled() =>
            {
                let exit_code = *exit_code;
                log::warn!(
                    target: "orbit_encode::encode",
                    "Encoder exited with code {}; retrying",
                    exit_code
                );
                discard_partial(job.output).await;
                throttle.acquire().await;
                if job.cancel.is_cancelled() {
                    result = EncodeResult::Cancelled;
                } else {
                    reporter
                        .update(&format!(
                            "Encoder exited with code {}. Retrying ({}/{})...",
                            exit_code,
                            attempt + 1,
                            max_attempts
                        ))
                        .await;
                    continue;
                }
            }
            _ => {}
        }
        job.log.flush().await;
        if result != EncodeResult::Success {
            discard_partial(job.output).await;
        }
        return EncodeOutcome {
            result,
            attempts: attempt,
            elapsed: started.elapsed(),
        };
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!(
            target: "orbit_encode::encode",
            "Failed to remove partial output {}: {}",
            path.display(),
            e
        );
    }
}
