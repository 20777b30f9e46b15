//! FFprobe-based media inspection. Produces the immutable [`MediaProfile`] every
//! later stage reads from.

use crate::error::AppError;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Frame rate used when the probe reports a zero denominator.
const FALLBACK_FRAME_RATE: f64 = 23.976;
/// Assumed rational when the stream carries no `r_frame_rate` at all.
const DEFAULT_FRAME_RATE_RAW: &str = "24/1";

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    nb_frames: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    color_primaries: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

/// Probed description of the source. Immutable once produced.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProfile {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub frame_count: u64,
    /// 0 for silent sources.
    pub channel_count: u32,
    pub is_hdr: bool,
    pub codec_name: Option<String>,
    pub subtitle_stream_count: u32,
}

impl MediaProfile {
    pub fn hdr_label(&self) -> &'static str {
        if self.is_hdr { "HDR10" } else { "SDR" }
    }
}

/// Parses `"N/D"` or a plain decimal. A zero denominator yields the fallback rate.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                Some(FALLBACK_FRAME_RATE)
            } else {
                Some(num / den)
            }
        }
        None => s.trim().parse().ok(),
    }
}

/// Parse ffprobe JSON output into a MediaProfile.
pub fn parse_ffprobe_json(json: &str) -> Result<MediaProfile, AppError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| AppError::probe(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let streams = output.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| AppError::probe("No video stream found"))?;
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);

    if !(duration > 0.0) || height == 0 {
        return Err(AppError::probe(format!(
            "Unusable source: duration={} height={}",
            duration, height
        )));
    }

    let frame_rate = parse_frame_rate(video.r_frame_rate.as_deref().unwrap_or(DEFAULT_FRAME_RATE_RAW))
        .filter(|r| r.is_finite() && *r > 0.0)
        .unwrap_or(FALLBACK_FRAME_RATE);
    let frame_count = video
        .nb_frames
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or_else(|| (duration * frame_rate).floor() as u64);
    let channel_count = audio.and_then(|a| a.channels).unwrap_or(0);
    let is_hdr = video
        .color_primaries
        .as_deref()
        .is_some_and(|p| p.contains("bt2020"));
    let subtitle_stream_count = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("subtitle"))
        .count() as u32;

    Ok(MediaProfile {
        duration,
        width,
        height,
        frame_rate,
        frame_count,
        channel_count,
        is_hdr,
        codec_name: video.codec_name.clone(),
        subtitle_stream_count,
    })
}

/// Run ffprobe on a media file and return its profile.
pub async fn inspect(ffprobe: &Path, path: &Path) -> Result<MediaProfile, AppError> {
    log::debug!(
        target: "orbit_encode::ffmpeg::ffprobe",
        "inspect: path={}",
        path.display()
    );

    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::probe(format!("ffprobe failed: {}", stderr.trim())));
    }

    let json = String::from_utf8(output.stdout)
        .map_err(|_| AppError::probe("ffprobe output was not valid UTF-8"))?;
    let profile = parse_ffprobe_json(&json)?;
    log::info!(
        target: "orbit_encode::ffmpeg::ffprobe",
        "Source: {}x{} {:.3}fps {:.1}s, {} frames, {} audio channels, {}",
        profile.width,
        profile.height,
        profile.frame_rate,
        profile.duration,
        profile.frame_count,
        profile.channel_count,
        profile.hdr_label()
    );
    Ok(profile)
}
