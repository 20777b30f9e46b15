//! Argument vectors for every external tool invocation.
//!
//! Pure functions only: no I/O, so each command line is testable as data.

use std::path::Path;

use super::path_to_string;
use crate::config::AudioMode;
use crate::crop::CropRect;
use crate::params::EncodeSettings;
use crate::quality::SampleWindow;

/// Half-width of the selection band around each thumbnail timestamp.
const GRID_SELECT_TOLERANCE: f64 = 0.1;
const GRID_TILE_WIDTH: u32 = 480;
const GRID_FRAME_COUNT: u32 = 9;

/// `HH:MM:SS` from a non-negative offset, truncating fractional seconds.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Keyframe-only cropdetect burst at one offset. Crop tokens arrive on stderr.
pub fn build_cropdetect_args(
    source: &Path,
    at_seconds: f64,
    frames: u32,
    limit: u32,
    round: u32,
) -> Vec<String> {
    vec![
        "-skip_frame".to_string(),
        "nokey".to_string(),
        "-ss".to_string(),
        format_timestamp(at_seconds),
        "-i".to_string(),
        path_to_string(source),
        "-vframes".to_string(),
        frames.to_string(),
        "-vf".to_string(),
        format!("cropdetect=limit={}:round={}", limit, round),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

fn audio_args(settings: &EncodeSettings) -> Vec<String> {
    match settings.audio_mode {
        AudioMode::Opus => vec![
            "-c:a".to_string(),
            "libopus".to_string(),
            "-b:a".to_string(),
            settings.audio_bitrate.clone(),
        ],
        AudioMode::Passthrough => vec!["-c:a".to_string(), "copy".to_string()],
        AudioMode::None => vec![],
    }
}

/// Full SVT-AV1 encode. Progress goes to stdout as `key=value` lines; diagnostics to stderr.
pub fn build_encode_args(source: &Path, output: &Path, settings: &EncodeSettings) -> Vec<String> {
    let mut args = vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path_to_string(source),
        "-map".to_string(),
        "0:v:0".to_string(),
    ];
    if settings.audio_mode != AudioMode::None {
        args.push("-map".to_string());
        args.push("0:a?".to_string());
    }
    args.push("-map".to_string());
    args.push("0:s?".to_string());

    if let Some(chain) = settings.filter_chain() {
        args.push("-vf".to_string());
        args.push(chain);
    }

    args.extend([
        "-c:v".to_string(),
        "libsvtav1".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p10le".to_string(),
        "-crf".to_string(),
        settings.crf.to_string(),
        "-preset".to_string(),
        settings.preset.to_string(),
        "-svtav1-params".to_string(),
        settings.tune_flags.clone(),
        "-threads".to_string(),
        "0".to_string(),
    ]);
    args.extend(audio_args(settings));
    args.extend([
        "-c:s".to_string(),
        "copy".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        "-y".to_string(),
        path_to_string(output),
    ]);
    args
}

/// `select='between(t,a,b)+...',setpts=N/FRAME_RATE/TB`, or just the setpts
/// reset when the whole asset is scored.
fn select_filter(windows: &[SampleWindow]) -> String {
    if windows.is_empty() {
        return "setpts=N/FRAME_RATE/TB".to_string();
    }
    let expr = windows
        .iter()
        .map(|w| format!("between(t,{},{})", w.start, w.end))
        .collect::<Vec<_>>()
        .join("+");
    format!("select='{}',setpts=N/FRAME_RATE/TB", expr)
}

/// Quality filter graph. Input 0 is the encoded output, input 1 the source.
/// The reference is cropped like the encode; the distorted stream is scaled
/// back to the reference size so both metrics compare equal geometry.
pub fn build_quality_filter(
    windows: &[SampleWindow],
    crop: Option<&CropRect>,
    reference_width: u32,
    reference_height: u32,
) -> String {
    let select = select_filter(windows);
    let reference = match crop {
        Some(c) => format!("crop={},{}", c, select),
        None => select.clone(),
    };
    format!(
        "[1:v]{reference}[r];\
         [0:v]{select},scale={reference_width}:{reference_height}:flags=bicubic[d];\
         [d]split=2[d1][d2];\
         [r]split=2[r1][r2];\
         [d1][r1]libvmaf;\
         [d2][r2]ssim"
    )
}

pub fn build_quality_args(distorted: &Path, reference: &Path, filter_graph: &str) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-threads".to_string(),
        "0".to_string(),
        "-i".to_string(),
        path_to_string(distorted),
        "-i".to_string(),
        path_to_string(reference),
        "-filter_complex".to_string(),
        filter_graph.to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

/// Nine frames at `i * d / 10`, scaled and tiled 3x3 into one JPEG.
pub fn build_grid_args(input: &Path, output: &Path, duration: f64) -> Vec<String> {
    let interval = duration / 10.0;
    let expr = (1..=GRID_FRAME_COUNT)
        .map(|i| {
            let t = i as f64 * interval;
            format!(
                "between(t,{},{})",
                (t - GRID_SELECT_TOLERANCE).max(0.0),
                t + GRID_SELECT_TOLERANCE
            )
        })
        .collect::<Vec<_>>()
        .join("+");
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path_to_string(input),
        "-vf".to_string(),
        format!(
            "select='{}',setpts=N/FRAME_RATE/TB,scale={}:-1,tile=3x3",
            expr, GRID_TILE_WIDTH
        ),
        "-frames:v".to_string(),
        "1".to_string(),
        "-q:v".to_string(),
        "3".to_string(),
        "-y".to_string(),
        path_to_string(output),
    ]
}

/// mkvmerge: video, audio and subtitles from the encode; attachments and
/// chapters from the source.
pub fn build_remux_args(encoded: &Path, source: &Path, fixed: &Path) -> Vec<String> {
    vec![
        "-o".to_string(),
        path_to_string(fixed),
        path_to_string(encoded),
        "--no-video".to_string(),
        "--no-audio".to_string(),
        "--no-subtitles".to_string(),
        path_to_string(source),
    ]
}

/// One flag (with its value, if any) per line, for debug logs.
pub fn format_args_for_display_multiline(args: &[String]) -> String {
    let mut lines = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match iter.peek() {
            Some(value) if arg.starts_with('-') && arg.len() > 1 && !value.starts_with('-') => {
                lines.push(format!("  {} {}", arg, value));
                iter.next();
            }
            _ => lines.push(format!("  {}", arg)),
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::VideoFilter;

    fn settings() -> EncodeSettings {
        EncodeSettings {
            crf: 42,
            preset: 6,
            video_filters: vec![],
            audio_mode: AudioMode::Opus,
            audio_bitrate: "128k".to_string(),
            tune_flags: "tune=0".to_string(),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let idx = args.iter().position(|a| a == flag)?;
        args.get(idx + 1).map(String::as_str)
    }

    #[test]
    fn timestamp_formats_hours() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(18.9), "00:00:18");
        assert_eq!(format_timestamp(3725.0), "01:02:05");
        assert_eq!(format_timestamp(-3.0), "00:00:00");
    }

    #[test]
    fn cropdetect_burst() {
        let args = build_cropdetect_args(Path::new("/src.mkv"), 90.0, 20, 24, 2);
        assert_eq!(&args[..4], ["-skip_frame", "nokey", "-ss", "00:01:30"]);
        assert_eq!(value_after(&args, "-vframes"), Some("20"));
        assert_eq!(value_after(&args, "-vf"), Some("cropdetect=limit=24:round=2"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn encode_args_core_layout() {
        let args = build_encode_args(Path::new("/in.mkv"), Path::new("/out.mkv"), &settings());
        assert_eq!(value_after(&args, "-c:v"), Some("libsvtav1"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p10le"));
        assert_eq!(value_after(&args, "-crf"), Some("42"));
        assert_eq!(value_after(&args, "-preset"), Some("6"));
        assert_eq!(value_after(&args, "-svtav1-params"), Some("tune=0"));
        assert_eq!(value_after(&args, "-c:a"), Some("libopus"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-c:s"), Some("copy"));
        assert_eq!(value_after(&args, "-progress"), Some("pipe:1"));
        assert!(args.contains(&"0:a?".to_string()));
        assert!(args.contains(&"0:s?".to_string()));
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/out.mkv"));
    }

    #[test]
    fn crop_precedes_scale_in_filter_chain() {
        let mut s = settings();
        s.video_filters = vec![
            VideoFilter::Crop("1920:800:0:140".parse().unwrap()),
            VideoFilter::Scale { height: 720 },
        ];
        let args = build_encode_args(Path::new("/in.mkv"), Path::new("/out.mkv"), &s);
        assert_eq!(
            value_after(&args, "-vf"),
            Some("crop=1920:800:0:140,scale=-2:720")
        );
    }

    #[test]
    fn passthrough_audio_copies() {
        let mut s = settings();
        s.audio_mode = AudioMode::Passthrough;
        let args = build_encode_args(Path::new("/in.mkv"), Path::new("/out.mkv"), &s);
        assert_eq!(value_after(&args, "-c:a"), Some("copy"));
        assert!(!args.contains(&"-b:a".to_string()));
    }

    #[test]
    fn no_audio_emits_no_audio_command() {
        let mut s = settings();
        s.audio_mode = AudioMode::None;
        let args = build_encode_args(Path::new("/in.mkv"), Path::new("/out.mkv"), &s);
        assert!(!args.contains(&"-c:a".to_string()));
        assert!(!args.contains(&"0:a?".to_string()));
    }

    #[test]
    fn quality_filter_windows_and_crop() {
        let windows = [
            SampleWindow { start: 7.5, end: 12.5 },
            SampleWindow { start: 27.5, end: 32.5 },
        ];
        let crop: CropRect = "1920:800:0:140".parse().unwrap();
        let graph = build_quality_filter(&windows, Some(&crop), 1920, 800);
        assert!(graph.starts_with(
            "[1:v]crop=1920:800:0:140,select='between(t,7.5,12.5)+between(t,27.5,32.5)',setpts=N/FRAME_RATE/TB[r];"
        ));
        assert!(graph.contains("scale=1920:800:flags=bicubic[d]"));
        assert!(graph.ends_with("[d1][r1]libvmaf;[d2][r2]ssim"));
    }

    #[test]
    fn quality_filter_full_asset_without_crop() {
        let graph = build_quality_filter(&[], None, 1280, 720);
        assert!(graph.starts_with("[1:v]setpts=N/FRAME_RATE/TB[r];"));
        assert!(!graph.contains("select="));
        assert!(!graph.contains("crop="));
    }

    #[test]
    fn quality_args_put_output_first() {
        let args = build_quality_args(Path::new("/out.mkv"), Path::new("/src.mkv"), "G");
        let inputs: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-i")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(inputs, ["/out.mkv", "/src.mkv"]);
        assert_eq!(value_after(&args, "-filter_complex"), Some("G"));
    }

    #[test]
    fn grid_selects_nine_frames() {
        let args = build_grid_args(Path::new("/out.mkv"), Path::new("/grid.jpg"), 100.0);
        let vf = value_after(&args, "-vf").unwrap();
        assert_eq!(vf.matches("between(").count(), 9);
        assert!(vf.contains("between(t,9.9,10.1)"));
        assert!(vf.ends_with("scale=480:-1,tile=3x3"));
        assert_eq!(value_after(&args, "-q:v"), Some("3"));
    }

    #[test]
    fn remux_takes_tracks_from_encode_and_extras_from_source() {
        let args = build_remux_args(
            Path::new("/out.mkv"),
            Path::new("/src.mkv"),
            Path::new("/fixed.mkv"),
        );
        assert_eq!(
            args,
            [
                "-o",
                "/fixed.mkv",
                "/out.mkv",
                "--no-video",
                "--no-audio",
                "--no-subtitles",
                "/src.mkv"
            ]
        );
    }

    #[test]
    fn display_pairs_flags_with_values() {
        let args: Vec<String> = ["-y", "-i", "in.mkv", "-crf", "30", "out.mkv"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            format_args_for_display_multiline(&args),
            "  -y\n  -i in.mkv\n  -crf 30\n  out.mkv"
        );
    }

    #[test]
    fn display_keeps_lone_dash_output() {
        let args: Vec<String> = ["-f", "null", "-"].iter().map(|s| s.to_string()).collect();
        assert_eq!(format_args_for_display_multiline(&args), "  -f null\n  -");
    }
}
