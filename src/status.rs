//! Remote status channel contract, overload backoff, per-stage throttling and
//! the text every stage renders into the channel.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::UserOverrides;
use crate::ffmpeg::{MediaProfile, ProgressSample, format_timestamp};
use crate::params::EncodeSettings;
use crate::quality::QualityReport;

const PROGRESS_SEGMENTS: usize = 15;
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel demands a pause of exactly `retry_after` before the next write.
    #[error("overloaded, retry after {}s", retry_after.as_secs())]
    Overloaded { retry_after: Duration },

    #[error("{0}")]
    Failed(String),
}

/// Opaque id of a message that can later be edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct MessageHandle(pub u64);

/// What the pipeline needs from a chat-like status sink.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<MessageHandle, ChannelError>;
    async fn edit_message(&self, handle: MessageHandle, text: &str) -> Result<(), ChannelError>;
    async fn send_file(&self, path: &Path, caption: Option<&str>) -> Result<(), ChannelError>;
}

/// Run `op`, sleeping exactly the mandated duration and retrying on every
/// overload signal, up to `budget` signals. Permanent failures return at once.
pub async fn with_backoff<T, F, Fut>(budget: u32, mut op: F) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut overloads = 0;
    loop {
        match op().await {
            Err(ChannelError::Overloaded { retry_after }) if overloads < budget => {
                overloads += 1;
                log::warn!(
                    target: "orbit_encode::status",
                    "Status channel overloaded; sleeping {}s ({}/{})",
                    retry_after.as_secs_f64(),
                    overloads,
                    budget
                );
                tokio::time::sleep(retry_after).await;
            }
            other => return other,
        }
    }
}

/// Minimum spacing between two consecutive status writes of one stage.
#[derive(Debug, Clone)]
pub struct StatusThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl StatusThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Whether a write would be allowed now. Does not restart the window.
    pub fn is_open(&self) -> bool {
        self.last_emit
            .is_none_or(|last| last.elapsed() >= self.min_interval)
    }

    /// Restart the window at the current instant.
    pub fn mark(&mut self) {
        self.last_emit = Some(Instant::now());
    }

    /// True (and the window restarts) when a write is allowed now.
    pub fn try_acquire(&mut self) -> bool {
        let open = self.is_open();
        if open {
            self.mark();
        }
        open
    }

    /// Wait until a write is allowed, then restart the window.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_emit {
            tokio::time::sleep_until(last + self.min_interval).await;
        }
        self.mark();
    }
}

/// Single live status message plus the delivery writes of one run.
///
/// Progress edits are best effort: failures are logged and dropped. Final
/// delivery writes return their error.
pub struct StatusReporter {
    channel: Arc<dyn StatusChannel>,
    overload_budget: u32,
    handle: Option<MessageHandle>,
}

impl StatusReporter {
    pub fn new(channel: Arc<dyn StatusChannel>, overload_budget: u32) -> Self {
        Self {
            channel,
            overload_budget,
            handle: None,
        }
    }

    #[cfg(test)]
    fn handle(&self) -> Option<MessageHandle> {
        self.handle
    }

    /// Edit the live status message, creating it on first use.
    pub async fn update(&mut self, text: &str) {
        let channel = &self.channel;
        let result = match self.handle {
            Some(handle) => {
                with_backoff(self.overload_budget, || channel.edit_message(handle, text)).await
            }
            None => match with_backoff(self.overload_budget, || channel.send_message(text)).await {
                Ok(handle) => {
                    self.handle = Some(handle);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            log::warn!(
                target: "orbit_encode::status",
                "Dropped status update: {}",
                e
            );
        }
    }

    /// Standalone message that must arrive.
    pub async fn send_report(&self, text: &str) -> Result<MessageHandle, ChannelError> {
        let channel = &self.channel;
        with_backoff(self.overload_budget, || channel.send_message(text)).await
    }

    /// File that must arrive.
    pub async fn deliver_file(&self, path: &Path, caption: Option<&str>) -> Result<(), ChannelError> {
        let channel = &self.channel;
        with_backoff(self.overload_budget, || channel.send_file(path, caption)).await
    }

    /// File whose loss is tolerable (diagnostic logs, previews).
    pub async fn send_file_best_effort(&self, path: &Path, caption: Option<&str>) {
        if let Err(e) = self.deliver_file(path, caption).await {
            log::warn!(
                target: "orbit_encode::status",
                "Failed to send {}: {}",
                path.display(),
                e
            );
        }
    }
}

/// `[▰▰▰▱▱…]` with 15 segments.
pub fn progress_bar(percentage: f64) -> String {
    let pct = if percentage.is_finite() {
        percentage.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let done = ((pct / 100.0) * PROGRESS_SEGMENTS as f64) as usize;
    format!(
        "[{}{}]",
        "▰".repeat(done),
        "▱".repeat(PROGRESS_SEGMENTS - done)
    )
}

pub fn format_mib(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / MIB)
}

/// Descriptive labels for one run, shared by status and report texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLabels {
    pub file_name: String,
    pub crf: u32,
    pub preset: u32,
    pub resolution: String,
    pub cropped: bool,
    pub hdr: &'static str,
    pub grain: u32,
    pub audio: String,
}

impl RunLabels {
    pub fn new(
        file_name: &str,
        profile: &MediaProfile,
        settings: &EncodeSettings,
        overrides: &UserOverrides,
    ) -> Self {
        Self {
            file_name: file_name.to_string(),
            crf: settings.crf,
            preset: settings.preset,
            resolution: format!("{}p", overrides.res.unwrap_or(profile.height)),
            cropped: settings.crop().is_some(),
            hdr: profile.hdr_label(),
            grain: overrides.grain,
            audio: settings.audio_label(),
        }
    }

    /// `1080p | Cropped | SDR | 10-bit | Grain: 8`
    pub fn video_line(&self) -> String {
        let mut parts = vec![self.resolution.clone()];
        if self.cropped {
            parts.push("Cropped".to_string());
        }
        parts.push(self.hdr.to_string());
        parts.push("10-bit".to_string());
        if self.grain > 0 {
            parts.push(format!("Grain: {}", self.grain));
        }
        parts.join(" | ")
    }
}

pub const TEXT_BOOT: &str = "Initializing encode pipeline...";
pub const TEXT_PROBING: &str = "Analyzing source...";
pub const TEXT_CROP: &str = "Detecting borders...";
pub const TEXT_REMUX: &str = "Finalizing metadata and attachments...";
pub const TEXT_OVERFLOW: &str = "Size overflow. Rerouting to external transfer...";
pub const TEXT_UPLOADING: &str = "Transmitting final video...";
pub const TEXT_CANCELLED: &str = "Encode cancelled. Workspace cleaned up.";

pub fn render_encode_status(labels: &RunLabels, sample: &ProgressSample, duration: f64) -> String {
    format!(
        "ENCODING: {file}\n\
         {bar} {pct:.1}%\n\
         Time: {elapsed} / ETA {eta}\n\
         Position: {pos} / {total}\n\
         Speed: {speed:.2}x | {fps:.1} fps\n\
         Size: {size}\n\
         CRF {crf} | Preset {preset}\n\
         Video: {video}\n\
         Audio: {audio}",
        file = labels.file_name,
        bar = progress_bar(sample.percentage),
        pct = sample.percentage,
        elapsed = format_timestamp(sample.elapsed.as_secs_f64()),
        eta = format_timestamp(sample.eta),
        pos = format_timestamp(sample.position_seconds),
        total = format_timestamp(duration),
        speed = sample.speed,
        fps = sample.fps,
        size = format_mib(sample.output_bytes),
        crf = labels.crf,
        preset = labels.preset,
        video = labels.video_line(),
        audio = labels.audio,
    )
}

pub fn render_quality_status(sample: &ProgressSample, sampled_secs: f64) -> String {
    format!(
        "ANALYSIS: VMAF + SSIM ({:.0}s sampled)\n{} {:.1}%\nSpeed: {:.1} fps\nETA: {}",
        sampled_secs,
        progress_bar(sample.percentage),
        sample.percentage,
        sample.fps,
        format_timestamp(sample.eta)
    )
}

fn quality_line(quality: &QualityReport) -> String {
    format!("Quality: VMAF {:.2} | SSIM {:.4}", quality.vmaf, quality.ssim)
}

/// Caption for a directly delivered artifact.
pub fn render_final_report(
    labels: &RunLabels,
    encode_time: Duration,
    size_bytes: u64,
    quality: &QualityReport,
) -> String {
    format!(
        "ENCODE COMPLETE\n\n\
         File: {}\n\
         Encode time: {}\n\
         Final size: {}\n\
         {}\n\n\
         Preset {} | CRF {}\n\
         Video: {}\n\
         Audio: {}",
        labels.file_name,
        format_timestamp(encode_time.as_secs_f64()),
        format_mib(size_bytes),
        quality_line(quality),
        labels.preset,
        labels.crf,
        labels.video_line(),
        labels.audio
    )
}

pub fn render_overflow_report(
    labels: &RunLabels,
    size_bytes: u64,
    quality: &QualityReport,
    transfer_url: &str,
) -> String {
    format!(
        "ENCODE COMPLETE (OVERFLOW)\n\n\
         File: {}\n\
         Size: {} (over the direct delivery limit)\n\
         {}\n\n\
         External link (time-limited):\n{}\n\n\
         Encode log follows.",
        labels.file_name,
        format_mib(size_bytes),
        quality_line(quality),
        transfer_url
    )
}

pub fn render_encode_failure(exit_code: i32, attempts: u32, log_tail: &str) -> String {
    format!(
        "ENCODE FAILED (exit code {}, {} attempt{})\n\n{}",
        exit_code,
        attempts,
        if attempts == 1 { "" } else { "s" },
        log_tail
    )
}

pub fn render_fatal(error: &str) -> String {
    format!("PIPELINE FAILED\n\n{}", error)
}
