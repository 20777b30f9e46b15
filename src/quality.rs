//! Scene-sampled quality scoring (VMAF + SSIM in one pass).

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::crop::CropRect;
use crate::error::AppError;
use crate::ffmpeg::progress::parse_frame;
use crate::ffmpeg::{
    CancelFlag, Invocation, LineSink, MediaProfile, ProgressSample, Score, ScoreScanner,
    StreamSource, build_quality_args, build_quality_filter, format_args_for_display_multiline,
    run_tool,
};
use crate::status::{StatusReporter, StatusThrottle, render_quality_status};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub vmaf: Score,
    pub ssim: Score,
}

impl QualityReport {
    pub fn not_available() -> Self {
        Self::default()
    }
}

/// Time range `[start, end]` in seconds selected for scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleWindow {
    pub start: f64,
    pub end: f64,
}

/// Evenly spread windows, each centered in its slice of the duration.
/// Empty when the asset is short enough to score in full.
pub fn sample_windows(duration: f64, count: u32, window_secs: f64) -> Vec<SampleWindow> {
    if count == 0 || duration <= count as f64 * window_secs {
        return Vec::new();
    }
    let slice = duration / count as f64;
    (0..count)
        .map(|i| {
            let center = i as f64 * slice + slice / 2.0;
            let start = center - window_secs / 2.0;
            SampleWindow {
                start,
                end: start + window_secs,
            }
        })
        .collect()
}

/// Seconds of material the pass will compare.
pub fn sampled_seconds(windows: &[SampleWindow], duration: f64) -> f64 {
    if windows.is_empty() {
        duration
    } else {
        windows.iter().map(|w| w.end - w.start).sum()
    }
}

struct QualityProgress<'a> {
    reporter: Option<&'a mut StatusReporter>,
    throttle: StatusThrottle,
    expected_frames: u64,
    sampled_secs: f64,
    started: Instant,
    scores: ScoreScanner,
}

#[async_trait]
impl LineSink for QualityProgress<'_> {
    async fn on_line(&mut self, source: StreamSource, line: &str) {
        match source {
            StreamSource::Stderr => self.scores.feed(line),
            StreamSource::Stdout => {
                let Some(frame) = parse_frame(line) else {
                    return;
                };
                let Some(reporter) = self.reporter.as_deref_mut() else {
                    return;
                };
                if self.throttle.try_acquire() {
                    let sample = ProgressSample::from_frames(
                        frame,
                        self.expected_frames,
                        self.started.elapsed(),
                    );
                    reporter
                        .update(&render_quality_status(&sample, self.sampled_secs))
                        .await;
                }
            }
        }
    }
}

/// Inputs for one quality pass.
pub struct QualityJob<'a> {
    pub ffmpeg: &'a Path,
    pub output: &'a Path,
    pub source: &'a Path,
    pub crop: Option<&'a CropRect>,
    pub profile: &'a MediaProfile,
    pub cancel: &'a CancelFlag,
    pub config: &'a PipelineConfig,
}

/// Score the output against the source. Any failure yields N/A scores; only
/// cancellation is returned as an error.
pub async fn assess_quality(
    job: &QualityJob<'_>,
    reporter: Option<&mut StatusReporter>,
) -> Result<QualityReport, AppError> {
    let windows = sample_windows(
        job.profile.duration,
        job.config.quality_window_count,
        job.config.quality_window_secs,
    );
    let sampled_secs = sampled_seconds(&windows, job.profile.duration);
    let (ref_w, ref_h) = match job.crop {
        Some(c) => (c.width, c.height),
        None => (job.profile.width, job.profile.height),
    };
    let graph = build_quality_filter(&windows, job.crop, ref_w, ref_h);
    let args = build_quality_args(job.output, job.source, &graph);
    log::debug!(
        target: "orbit_encode::quality",
        "ffmpeg\n{}",
        format_args_for_display_multiline(&args)
    );

    let mut progress = QualityProgress {
        reporter,
        throttle: StatusThrottle::new(job.config.quality_status_interval()),
        expected_frames: (sampled_secs * job.profile.frame_rate) as u64,
        sampled_secs,
        started: Instant::now(),
        scores: ScoreScanner::default(),
    };
    let outcome = run_tool(
        Invocation::new(job.ffmpeg, args).cancel(job.cancel),
        &mut progress,
    )
    .await;

    let report = QualityReport {
        vmaf: progress.scores.vmaf,
        ssim: progress.scores.ssim,
    };
    match outcome {
        Ok(o) if !o.success => log::warn!(
            target: "orbit_encode::quality",
            "Quality pass exited with code {}",
            o.code()
        ),
        Ok(_) => {}
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) => log::warn!(
            target: "orbit_encode::quality",
            "Quality pass failed: {}",
            e
        ),
    }
    if report.vmaf == Score::NotAvailable || report.ssim == Score::NotAvailable {
        log::warn!(
            target: "orbit_encode::quality",
            "Missing score label(s): vmaf={} ssim={}",
            report.vmaf,
            report.ssim
        );
    } else {
        log::info!(
            target: "orbit_encode::quality",
            "VMAF {} | SSIM {}",
            report.vmaf,
            report.ssim
        );
    }
    Ok(report)
}
