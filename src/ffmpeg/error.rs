//! Turn a failed tool run into a one-line diagnosis plus the raw detail.
//!
//! Known stderr signatures win over the exit code, since ffmpeg exits 1 for
//! nearly everything. Codes above 128 are the shell's signal encoding.

use serde::Serialize;

/// Failure payload for the event stream. Summary is shown; detail is the raw tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

const SIGNATURES: &[(&str, &str)] = &[
    ("Unknown encoder 'libsvtav1'", "This ffmpeg build has no SVT-AV1 encoder."),
    ("No such filter: 'libvmaf'", "This ffmpeg build has no libvmaf filter."),
    ("No such file or directory", "Source file is missing."),
    ("Invalid data found when processing input", "Source file is not a readable media file."),
    ("No space left on device", "Work directory ran out of disk space."),
    ("Cannot allocate memory", "Encoder ran out of memory."),
];

fn signal_summary(code: i32) -> Option<String> {
    let name = match code.checked_sub(128)? {
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(format!("Encoder was killed by {}.", name))
}

/// Diagnose a failure from its stderr tail and exit code.
pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let detail = stderr.trim().to_string();
    let summary = SIGNATURES
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, summary)| summary.to_string())
        .or_else(|| exit_code.and_then(signal_summary))
        .unwrap_or_else(|| match exit_code {
            Some(-1) => "Tool could not be started or timed out.".to_string(),
            Some(code) => format!("Encoder exited with code {}.", code),
            None => last_meaningful_line(stderr),
        });
    FfmpegErrorPayload { summary, detail }
}

fn last_meaningful_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(160).collect())
        .unwrap_or_else(|| "Unknown failure.".to_string())
}

/// Last `max_lines` non-empty lines of a log, oldest first.
pub fn log_tail(log: &str, max_lines: usize) -> String {
    let mut tail: Vec<&str> = log
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(max_lines)
        .collect();
    tail.reverse();
    tail.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_beats_exit_code() {
        let p = parse_ffmpeg_error(
            "[mkv @ 0x1] something\nUnknown encoder 'libsvtav1'\n",
            Some(1),
        );
        assert_eq!(p.summary, "This ffmpeg build has no SVT-AV1 encoder.");
        assert!(p.detail.ends_with("Unknown encoder 'libsvtav1'"));
    }

    #[test]
    fn signal_exit_codes() {
        assert_eq!(
            parse_ffmpeg_error("", Some(139)).summary,
            "Encoder was killed by SIGSEGV."
        );
        assert_eq!(
            parse_ffmpeg_error("", Some(137)).summary,
            "Encoder was killed by SIGKILL."
        );
        assert_eq!(
            parse_ffmpeg_error("", Some(130)).summary,
            "Encoder exited with code 130."
        );
    }

    #[test]
    fn plain_codes() {
        assert_eq!(parse_ffmpeg_error("x", Some(1)).summary, "Encoder exited with code 1.");
        assert_eq!(
            parse_ffmpeg_error("timed out", Some(-1)).summary,
            "Tool could not be started or timed out."
        );
    }

    #[test]
    fn no_code_uses_last_line() {
        let p = parse_ffmpeg_error("first\nconversion failed!\n\n", None);
        assert_eq!(p.summary, "conversion failed!");
        assert_eq!(parse_ffmpeg_error("  ", None).summary, "Unknown failure.");
    }

    #[test]
    fn log_tail_keeps_last_lines_in_order() {
        let log = "one\ntwo\n\nthree\nfour\n";
        assert_eq!(log_tail(log, 2), "three\nfour");
        assert_eq!(log_tail(log, 10), "one\ntwo\nthree\nfour");
        assert_eq!(log_tail("", 5), "");
    }
}
