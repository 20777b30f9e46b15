//! Crop consensus: sample a few temporally distant points, keep the dominant
//! border rectangle at each, and only accept a crop a supermajority agrees on.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::ffmpeg::{
    Invocation, LineSink, StreamSource, build_cropdetect_args, format_timestamp, run_tool,
};

static CROP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"crop=(\d+):(\d+):(\d+):(\d+)").expect("invalid cropdetect regex")
});

/// Border-free region of the frame, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropRect {
    /// Zero offsets mean the detector saw no bars; that is "no crop".
    pub fn normalize(self) -> Option<Self> {
        if self.x == 0 && self.y == 0 {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid crop rectangle: {0:?}")]
pub struct ParseCropError(String);

impl FromStr for CropRect {
    type Err = ParseCropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u32> = s
            .split(':')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseCropError(s.to_string()))?;
        match parts.as_slice() {
            [width, height, x, y] if *width > 0 && *height > 0 => Ok(Self {
                width: *width,
                height: *height,
                x: *x,
                y: *y,
            }),
            _ => Err(ParseCropError(s.to_string())),
        }
    }
}

/// `[Parsed_cropdetect_0 @ 0x..] x1:0 x2:1919 ... crop=1920:800:0:140` → rect
pub fn parse_cropdetect_line(line: &str) -> Option<CropRect> {
    let caps = CROP_RE.captures(line)?;
    let field = |i: usize| caps[i].parse::<u32>().ok();
    let rect = CropRect {
        width: field(1)?,
        height: field(2)?,
        x: field(3)?,
        y: field(4)?,
    };
    (rect.width > 0 && rect.height > 0).then_some(rect)
}

/// Runs one border-detection burst at an offset and returns every rectangle it reported.
#[async_trait]
pub trait CropSampler: Send + Sync {
    async fn sample(&self, at_seconds: f64) -> Result<Vec<CropRect>, AppError>;
}

/// Samples with ffmpeg's `cropdetect` filter.
pub struct FfmpegCropSampler {
    ffmpeg: PathBuf,
    source: PathBuf,
    config: PipelineConfig,
}

impl FfmpegCropSampler {
    pub fn new(ffmpeg: impl Into<PathBuf>, source: impl Into<PathBuf>, config: &PipelineConfig) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            source: source.into(),
            config: config.clone(),
        }
    }
}

#[derive(Default)]
struct CropCollector(Vec<CropRect>);

#[async_trait]
impl LineSink for CropCollector {
    async fn on_line(&mut self, source: StreamSource, line: &str) {
        if source == StreamSource::Stderr
            && let Some(rect) = parse_cropdetect_line(line)
        {
            self.0.push(rect);
        }
    }
}

#[async_trait]
impl CropSampler for FfmpegCropSampler {
    async fn sample(&self, at_seconds: f64) -> Result<Vec<CropRect>, AppError> {
        let args = build_cropdetect_args(
            &self.source,
            at_seconds,
            self.config.crop_burst_frames,
            self.config.cropdetect_limit,
            self.config.cropdetect_round,
        );
        let mut collector = CropCollector::default();
        let outcome = run_tool(
            Invocation::new(&self.ffmpeg, args).timeout(self.config.crop_sample_timeout()),
            &mut collector,
        )
        .await?;
        if !outcome.success && collector.0.is_empty() {
            return Err(AppError::ffmpeg_failed(outcome.code(), outcome.stderr_tail));
        }
        Ok(collector.0)
    }
}

/// Most frequent item and its count; ties go to the one seen first.
fn mode_first_seen<T: PartialEq + Copy>(items: &[T]) -> Option<(T, usize)> {
    let mut tally: Vec<(T, usize)> = Vec::new();
    for item in items {
        match tally.iter_mut().find(|(seen, _)| seen == item) {
            Some((_, count)) => *count += 1,
            None => tally.push((*item, 1)),
        }
    }
    tally.into_iter().fold(None, |best, (item, count)| match best {
        Some((_, best_count)) if best_count >= count => best,
        _ => Some((item, count)),
    })
}

/// Reduce per-point winners to a single rectangle, or `None` without consensus.
pub fn consensus(point_winners: &[CropRect], threshold: usize) -> Option<CropRect> {
    let (rect, votes) = mode_first_seen(point_winners)?;
    if votes >= threshold {
        rect.normalize()
    } else {
        log::info!(
            target: "orbit_encode::crop",
            "No crop consensus: {} won {}/{} sample points (need {})",
            rect,
            votes,
            point_winners.len(),
            threshold
        );
        None
    }
}

/// Crop rectangle agreed on across the configured sample points, if any.
///
/// Sources shorter than the minimum duration are never sampled. A failed
/// sample is excluded from the vote.
pub async fn detect_crop(
    sampler: &dyn CropSampler,
    duration: f64,
    config: &PipelineConfig,
) -> Option<CropRect> {
    if duration < config.crop_min_duration_secs {
        log::debug!(
            target: "orbit_encode::crop",
            "Skipping crop detection for {:.1}s source",
            duration
        );
        return None;
    }

    let mut winners = Vec::with_capacity(config.crop_sample_fractions.len());
    for fraction in &config.crop_sample_fractions {
        let at = duration * fraction;
        match sampler.sample(at).await {
            Ok(rects) => match mode_first_seen(&rects) {
                Some((rect, _)) => {
                    log::debug!(
                        target: "orbit_encode::crop",
                        "{}: {} ({} detections)",
                        format_timestamp(at),
                        rect,
                        rects.len()
                    );
                    winners.push(rect);
                }
                None => log::debug!(
                    target: "orbit_encode::crop",
                    "{}: no detections",
                    format_timestamp(at)
                ),
            },
            Err(e) => log::warn!(
                target: "orbit_encode::crop",
                "Crop sample at {} failed: {}",
                format_timestamp(at),
                e
            ),
        }
    }

    let crop = consensus(&winners, config.crop_consensus);
    log::info!(
        target: "orbit_encode::crop",
        "Crop: {}",
        crop.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
    );
    crop
}
