//! Score extraction from the quality pass's diagnostic stream.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static VMAF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"VMAF score:\s*([0-9]+(?:\.[0-9]+)?)").expect("invalid vmaf regex"));
static SSIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SSIM Y:.*All:\s*([0-9]+(?:\.[0-9]+)?)").expect("invalid ssim regex")
});

/// A metric result. `NotAvailable` is a valid terminal value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Score {
    Value(f64),
    #[default]
    NotAvailable,
}

impl Score {
    /// Later values replace earlier ones; N/A never overwrites a value.
    fn merge(&mut self, other: Option<f64>) {
        if let Some(v) = other {
            *self = Score::Value(v);
        }
    }
}

/// Two decimals unless the format asks for a precision (`{:.4}`).
impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Value(v) => write!(f, "{:.*}", f.precision().unwrap_or(2), v),
            Score::NotAvailable => f.write_str("N/A"),
        }
    }
}

impl serde::Serialize for Score {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Value(v) => serializer.serialize_f64(*v),
            Score::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

/// `VMAF score: 95.43` → 95.43
pub fn parse_vmaf_line(line: &str) -> Option<f64> {
    VMAF_RE.captures(line)?[1].parse().ok()
}

/// `[Parsed_ssim_5 @ 0x..] SSIM Y:0.98 (17.1) U:.. V:.. All:0.987654 (19.09)` → 0.987654
pub fn parse_ssim_line(line: &str) -> Option<f64> {
    SSIM_RE.captures(line)?[1].parse().ok()
}

/// Accumulates scores while the diagnostic stream is read line by line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreScanner {
    pub vmaf: Score,
    pub ssim: Score,
}

impl ScoreScanner {
    pub fn feed(&mut self, line: &str) {
        self.vmaf.merge(parse_vmaf_line(line));
        self.ssim.merge(parse_ssim_line(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmaf_line() {
        assert_eq!(
            parse_vmaf_line("[Parsed_libvmaf_6 @ 0x55d0c] VMAF score: 95.432100"),
            Some(95.4321)
        );
        assert_eq!(parse_vmaf_line("VMAF score: nan"), None);
    }

    #[test]
    fn ssim_line() {
        let line = "[Parsed_ssim_7 @ 0x1] SSIM Y:0.990 (20.0) U:0.99 (21.2) V:0.99 (21.0) All:0.987654 (19.08)";
        assert_eq!(parse_ssim_line(line), Some(0.987654));
        assert_eq!(parse_ssim_line("All:0.5 without label"), None);
    }

    #[test]
    fn scanner_defaults_to_not_available() {
        let mut scanner = ScoreScanner::default();
        scanner.feed("frame=10");
        scanner.feed("Conversion failed!");
        assert_eq!(scanner.vmaf, Score::NotAvailable);
        assert_eq!(scanner.ssim.to_string(), "N/A");
    }

    #[test]
    fn scanner_keeps_values_found() {
        let mut scanner = ScoreScanner::default();
        scanner.feed("VMAF score: 97.1");
        scanner.feed("unrelated");
        assert_eq!(scanner.vmaf, Score::Value(97.1));
        assert_eq!(scanner.vmaf.to_string(), "97.10");
        assert_eq!(format!("{:.4}", Score::Value(0.987654)), "0.9877");
        assert_eq!(format!("{:.4}", Score::NotAvailable), "N/A");
        assert_eq!(scanner.ssim, Score::NotAvailable);
    }

    #[test]
    fn score_serializes_na_as_string() {
        assert_eq!(serde_json::to_string(&Score::NotAvailable).unwrap(), "\"N/A\"");
        assert_eq!(serde_json::to_string(&Score::Value(1.5)).unwrap(), "1.5");
    }
}
