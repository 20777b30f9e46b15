//! One transcode run from probe to delivery.
//!
//! [`PipelineRun`] owns every piece of per-run state: the cancellation flag,
//! the status reporter, the temp workspace and the stage history. Stages are
//! strictly ordered; quality scoring and the thumbnail grid are the only
//! concurrent pair and both are joined before routing. The workspace removes
//! every run file on all exit paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{JobRequest, PipelineConfig};
use crate::crop::{CropRect, CropSampler, FfmpegCropSampler, detect_crop};
use crate::delivery::{Delivery, TransferEndpoint, fixed_path, reattach_ancillary, route_output};
use crate::encode::{EncodeJob, EncodeResult, run_encode_with_retry};
use crate::error::AppError;
use crate::ffmpeg::{CancelFlag, MediaProfile, RunLog, RunWorkspace, ToolPaths, inspect};
use crate::params::{EncodeSettings, select_parameters};
use crate::quality::{QualityJob, QualityReport, assess_quality};
use crate::status::{
    RunLabels, StatusChannel, StatusReporter, TEXT_BOOT, TEXT_CANCELLED, TEXT_CROP, TEXT_PROBING,
    TEXT_REMUX, TEXT_UPLOADING, render_encode_failure, render_fatal, render_final_report,
    render_overflow_report,
};
use crate::thumbnail::generate_grid;

const DEFAULT_OUTPUT_NAME: &str = "output.mkv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Idle,
    Probing,
    DetectingCrop,
    Encoding,
    Remuxing,
    Scoring,
    Routing,
    Delivering,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::Cancelled)
    }

    /// Stages only move forward; any live stage may end in Failed or Cancelled.
    fn can_enter(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Idle, Probing)
            | (Probing, DetectingCrop)
            | (DetectingCrop, Encoding)
            | (Encoding, Remuxing)
            | (Remuxing, Scoring)
            | (Scoring, Routing)
            | (Routing, Delivering)
            | (Delivering, Done) => true,
            _ => false,
        }
    }
}

/// Where a run reads its source and writes its files.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub source: PathBuf,
    pub work_dir: PathBuf,
    pub log_name: String,
    pub screenshot_name: String,
}

impl RunPaths {
    pub fn in_dir(work_dir: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            work_dir: work_dir.into(),
            log_name: "encode_log.txt".to_string(),
            screenshot_name: "grid_preview.jpg".to_string(),
        }
    }
}

/// What a delivered run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub profile: MediaProfile,
    pub crop: Option<CropRect>,
    pub settings: EncodeSettings,
    pub encode_attempts: u32,
    pub quality: QualityReport,
    pub delivery: Delivery,
    pub grid_sent: bool,
    pub stages: Vec<Stage>,
}

pub struct PipelineRun {
    request: JobRequest,
    config: PipelineConfig,
    tools: ToolPaths,
    source: PathBuf,
    output: PathBuf,
    log_path: PathBuf,
    grid_path: PathBuf,
    workspace: RunWorkspace,
    cancel: CancelFlag,
    channel: Arc<dyn StatusChannel>,
    endpoint: Arc<dyn TransferEndpoint>,
    crop_sampler: Option<Box<dyn CropSampler>>,
    stages: Vec<Stage>,
}

impl PipelineRun {
    pub fn new(
        request: JobRequest,
        config: PipelineConfig,
        tools: ToolPaths,
        paths: RunPaths,
        channel: Arc<dyn StatusChannel>,
        endpoint: Arc<dyn TransferEndpoint>,
    ) -> Self {
        let workspace = RunWorkspace::new(&paths.work_dir);
        let output_name = Path::new(&request.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string());
        workspace.register(paths.source.clone());
        let output = workspace.file(&output_name);
        workspace.register(fixed_path(&output));
        let log_path = workspace.file(&paths.log_name);
        let grid_path = workspace.file(&paths.screenshot_name);
        Self {
            request,
            config,
            tools,
            source: paths.source,
            output,
            log_path,
            grid_path,
            workspace,
            cancel: CancelFlag::new(),
            channel,
            endpoint,
            crop_sampler: None,
            stages: vec![Stage::Idle],
        }
    }

    /// Replace the ffmpeg-backed crop sampler.
    pub fn with_crop_sampler(mut self, sampler: Box<dyn CropSampler>) -> Self {
        self.crop_sampler = Some(sampler);
        self
    }

    /// Handle for the single writer that may cancel this run.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Idle)
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    fn enter(&mut self, next: Stage) {
        let current = self.stage();
        if !current.can_enter(next) {
            log::warn!(
                target: "orbit_encode::pipeline",
                "Illegal stage transition {:?} -> {:?}",
                current,
                next
            );
            return;
        }
        log::info!(target: "orbit_encode::pipeline", "Stage: {:?}", next);
        self.stages.push(next);
    }

    fn check_cancelled(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(AppError::aborted())
        } else {
            Ok(())
        }
    }

    /// Drive the run to a terminal stage. A terminal status is always
    /// attempted and every run file is removed before returning.
    pub async fn run(mut self) -> Result<RunSummary, AppError> {
        let mut reporter = StatusReporter::new(self.channel.clone(), self.config.overload_retry_budget);
        reporter.update(TEXT_BOOT).await;

        let result = self.execute(&mut reporter).await;
        match &result {
            Ok(summary) => {
                self.enter(Stage::Done);
                reporter
                    .update(&format!("Delivered {}.", self.request.file_name))
                    .await;
                log::info!(
                    target: "orbit_encode::pipeline",
                    "Run complete: {:?}, {} attempt(s)",
                    summary.delivery,
                    summary.encode_attempts
                );
            }
            Err(e) if e.is_cancellation() => {
                self.enter(Stage::Cancelled);
                reporter.update(TEXT_CANCELLED).await;
                log::info!(target: "orbit_encode::pipeline", "Run cancelled");
            }
            Err(e) => {
                self.enter(Stage::Failed);
                reporter.update(&render_fatal(&e.to_string())).await;
                log::error!(target: "orbit_encode::pipeline", "Run failed: {}", e);
            }
        }
        self.workspace.cleanup();

        result.map(|mut summary| {
            summary.stages = self.stages.clone();
            summary
        })
    }

    async fn execute(&mut self, reporter: &mut StatusReporter) -> Result<RunSummary, AppError> {
        self.enter(Stage::Probing);
        reporter.update(TEXT_PROBING).await;
        let profile = inspect(&self.tools.ffprobe, &self.source).await?;
        self.check_cancelled()?;

        self.enter(Stage::DetectingCrop);
        reporter.update(TEXT_CROP).await;
        let sampler: Box<dyn CropSampler> = match self.crop_sampler.take() {
            Some(s) => s,
            None => Box::new(FfmpegCropSampler::new(
                &self.tools.ffmpeg,
                &self.source,
                &self.config,
            )),
        };
        let crop = detect_crop(sampler.as_ref(), profile.duration, &self.config).await;
        self.check_cancelled()?;

        let settings = select_parameters(&profile, crop.as_ref(), &self.request.overrides, &self.config);
        let labels = RunLabels::new(
            &self.request.file_name,
            &profile,
            &settings,
            &self.request.overrides,
        );

        self.enter(Stage::Encoding);
        let log = RunLog::open_append(&self.log_path).await?;
        let job = EncodeJob {
            ffmpeg: &self.tools.ffmpeg,
            source: &self.source,
            output: &self.output,
            settings: &settings,
            profile: &profile,
            labels: &labels,
            log: &log,
            cancel: &self.cancel,
            config: &self.config,
        };
        let encode = run_encode_with_retry(&job, reporter).await;
        match encode.result {
            EncodeResult::Success => {}
            EncodeResult::Cancelled => return Err(AppError::aborted()),
            EncodeResult::Failed {
                exit_code,
                log_tail,
            } => {
                let caption = render_encode_failure(exit_code, encode.attempts, &log_tail);
                reporter
                    .send_file_best_effort(&self.log_path, Some(&caption))
                    .await;
                return Err(AppError::ffmpeg_failed(exit_code, log_tail));
            }
        }

        self.enter(Stage::Remuxing);
        reporter.update(TEXT_REMUX).await;
        reattach_ancillary(
            self.tools.mkvmerge.as_deref(),
            &self.output,
            &self.source,
            &fixed_path(&self.output),
        )
        .await;
        self.check_cancelled()?;

        self.enter(Stage::Scoring);
        let quality_job = QualityJob {
            ffmpeg: &self.tools.ffmpeg,
            output: &self.output,
            source: &self.source,
            crop: crop.as_ref(),
            profile: &profile,
            cancel: &self.cancel,
            config: &self.config,
        };
        let run_quality = self.request.run_quality;
        let quality_fut = async {
            if run_quality {
                assess_quality(&quality_job, Some(&mut *reporter)).await
            } else {
                Ok(QualityReport::not_available())
            }
        };
        let grid_fut = generate_grid(&self.tools.ffmpeg, &self.output, &self.grid_path, profile.duration);
        let (quality, grid) = tokio::join!(quality_fut, grid_fut);
        let quality = quality?;
        self.check_cancelled()?;

        self.enter(Stage::Routing);
        let delivery = route_output(
            &self.output,
            self.config.overflow_ceiling_bytes,
            self.endpoint.as_ref(),
            Some(&mut *reporter),
        )
        .await?;

        self.enter(Stage::Delivering);
        let mut grid_sent = false;
        match &delivery {
            Delivery::Direct { size_bytes } => {
                if let Some(grid) = &grid {
                    let caption = format!("Preview grid: {}", self.request.file_name);
                    grid_sent = reporter.deliver_file(grid, Some(&caption)).await.is_ok();
                }
                reporter.update(TEXT_UPLOADING).await;
                let report = render_final_report(&labels, encode.elapsed, *size_bytes, &quality);
                reporter.deliver_file(&self.output, Some(&report)).await?;
            }
            Delivery::Overflow {
                transfer_url,
                size_bytes,
            } => {
                let report = render_overflow_report(&labels, *size_bytes, &quality, transfer_url);
                reporter.send_report(&report).await?;
                reporter.send_file_best_effort(&self.log_path, None).await;
            }
        }

        Ok(RunSummary {
            profile,
            crop,
            settings,
            encode_attempts: encode.attempts,
            quality,
            delivery,
            grid_sent,
            stages: Vec::new(),
        })
    }
}
