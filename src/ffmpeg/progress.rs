use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static OUT_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^out_time_(?:ms|us)=(-?\d+)$").expect("invalid out_time regex")
});
static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^frame=\s*(\d+)$").expect("invalid frame regex"));

/// Output position in seconds from a `-progress` line.
///
/// FFmpeg reports `out_time_ms` in microseconds despite the name, same as `out_time_us`.
/// Negative positions (seen before the first packet is muxed) clamp to zero.
pub fn parse_out_time(line: &str) -> Option<f64> {
    let caps = OUT_TIME_RE.captures(line.trim())?;
    let micros: i64 = caps[1].parse().ok()?;
    Some(micros.max(0) as f64 / 1_000_000.0)
}

/// Frame counter from a `frame=N` progress line.
pub fn parse_frame(line: &str) -> Option<u64> {
    let caps = FRAME_RE.captures(line.trim())?;
    caps[1].parse().ok()
}

/// Derived progress metrics for one progress line. Only the latest is kept.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressSample {
    pub position_seconds: f64,
    pub elapsed: Duration,
    /// 0..=100
    pub percentage: f64,
    /// Output seconds per wall-clock second.
    pub speed: f64,
    pub fps: f64,
    /// Seconds; 0 when the percentage is 0.
    pub eta: f64,
    pub output_bytes: u64,
}

impl ProgressSample {
    /// Time-based sample for the encoder: position against the source duration.
    pub fn from_position(
        position_seconds: f64,
        duration: f64,
        total_frames: u64,
        elapsed: Duration,
        output_bytes: u64,
    ) -> Self {
        let percentage = if duration > 0.0 {
            (position_seconds / duration * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let secs = elapsed.as_secs_f64();
        let (speed, fps) = if secs > 0.0 {
            (
                position_seconds / secs,
                (percentage / 100.0 * total_frames as f64) / secs,
            )
        } else {
            (0.0, 0.0)
        };
        Self {
            position_seconds,
            elapsed,
            percentage,
            speed,
            fps,
            eta: eta_seconds(percentage, secs),
            output_bytes,
        }
    }

    /// Frame-based sample for the quality pass: frames done against the sampled frame total.
    pub fn from_frames(frame: u64, expected_frames: u64, elapsed: Duration) -> Self {
        let percentage = if expected_frames > 0 {
            (frame as f64 / expected_frames as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let secs = elapsed.as_secs_f64();
        let fps = if secs > 0.0 { frame as f64 / secs } else { 0.0 };
        let remaining = expected_frames.saturating_sub(frame) as f64;
        let eta = if fps > 0.0 { remaining / fps } else { 0.0 };
        Self {
            position_seconds: 0.0,
            elapsed,
            percentage,
            speed: 0.0,
            fps,
            eta,
            output_bytes: 0,
        }
    }
}

/// ETA = elapsed / p * (1 - p) with p in (0, 1]; 0 for p = 0.
pub fn eta_seconds(percentage: f64, elapsed_secs: f64) -> f64 {
    if !(percentage > 0.0) || !elapsed_secs.is_finite() {
        return 0.0;
    }
    let p = (percentage / 100.0).min(1.0);
    (elapsed_secs / p * (1.0 - p)).max(0.0)
}
