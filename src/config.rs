//! Policy constants and per-job user overrides.
//!
//! Every threshold the pipeline applies lives in [`PipelineConfig`] so one
//! implementation covers every variant; [`JobRequest`] carries what the user
//! asked for.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const MIB: u64 = 1024 * 1024;

/// One row of the resolution table: heights `>= min_height` get these defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionTier {
    pub min_height: u32,
    pub crf: u32,
    pub preset: u32,
}

impl ResolutionTier {
    const fn new(min_height: u32, crf: u32, preset: u32) -> Self {
        Self {
            min_height,
            crf,
            preset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Sources shorter than this are never crop-sampled.
    pub crop_min_duration_secs: f64,
    pub crop_sample_fractions: Vec<f64>,
    pub crop_burst_frames: u32,
    pub crop_sample_timeout_secs: u64,
    /// Sample points that must agree before a crop is applied.
    pub crop_consensus: usize,
    pub cropdetect_limit: u32,
    pub cropdetect_round: u32,

    pub encode_status_interval_secs: u64,
    pub quality_status_interval_secs: u64,
    /// Automatic re-runs of the encoder after a non-zero exit.
    pub encode_retries: u32,
    pub log_tail_lines: usize,

    pub quality_window_count: u32,
    pub quality_window_secs: f64,

    /// Artifacts at or above this size go to the transfer endpoint.
    pub overflow_ceiling_bytes: u64,
    pub multichannel_opus_bitrate: String,
    /// Overload signals honoured per status write before giving up.
    pub overload_retry_budget: u32,

    /// Ordered from the largest `min_height` down; the last row should have `min_height` 0.
    pub resolution_tiers: Vec<ResolutionTier>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            crop_min_duration_secs: 10.0,
            crop_sample_fractions: vec![0.15, 0.35, 0.55, 0.75],
            crop_burst_frames: 20,
            crop_sample_timeout_secs: 30,
            crop_consensus: 3,
            cropdetect_limit: 24,
            cropdetect_round: 2,
            encode_status_interval_secs: 8,
            quality_status_interval_secs: 5,
            encode_retries: 1,
            log_tail_lines: 20,
            quality_window_count: 6,
            quality_window_secs: 5.0,
            overflow_ceiling_bytes: 1990 * MIB,
            multichannel_opus_bitrate: "256k".to_string(),
            overload_retry_budget: 5,
            resolution_tiers: vec![
                ResolutionTier::new(2000, 32, 10),
                ResolutionTier::new(1000, 42, 6),
                ResolutionTier::new(700, 24, 6),
                ResolutionTier::new(0, 22, 4),
            ],
        }
    }
}

impl PipelineConfig {
    pub fn crop_sample_timeout(&self) -> Duration {
        Duration::from_secs(self.crop_sample_timeout_secs)
    }

    pub fn encode_status_interval(&self) -> Duration {
        Duration::from_secs(self.encode_status_interval_secs)
    }

    pub fn quality_status_interval(&self) -> Duration {
        Duration::from_secs(self.quality_status_interval_secs)
    }

    /// First tier whose `min_height` the height reaches; falls back to the last row.
    pub fn tier_for_height(&self, height: u32) -> ResolutionTier {
        self.resolution_tiers
            .iter()
            .find(|t| height >= t.min_height)
            .or(self.resolution_tiers.last())
            .copied()
            .unwrap_or(ResolutionTier::new(0, 22, 4))
    }
}

/// How audio streams are carried into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    #[default]
    Opus,
    #[serde(alias = "copy")]
    Passthrough,
    None,
}

impl AudioMode {
    /// Unknown values map to passthrough.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "opus" | "" => AudioMode::Opus,
            "none" | "off" => AudioMode::None,
            _ => AudioMode::Passthrough,
        }
    }
}

/// User overrides. `None` means "use the default"; a value replaces the default verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserOverrides {
    pub crf: Option<u32>,
    pub preset: Option<u32>,
    /// Target output height.
    pub res: Option<u32>,
    /// Film-grain synthesis strength; 0 disables it.
    pub grain: u32,
    pub audio_mode: AudioMode,
    pub audio_bitrate: String,
}

impl Default for UserOverrides {
    fn default() -> Self {
        Self {
            crf: None,
            preset: None,
            res: None,
            grain: 0,
            audio_mode: AudioMode::Opus,
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// Everything one run needs from its requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRequest {
    pub file_name: String,
    pub overrides: UserOverrides,
    pub run_quality: bool,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            file_name: "output.mkv".to_string(),
            overrides: UserOverrides::default(),
            run_quality: true,
        }
    }
}

impl JobRequest {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = JobRequest::default();

        let grain = match get("USER_GRAIN") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!(
                    target: "orbit_encode::config",
                    "USER_GRAIN={:?} is not a number; grain disabled",
                    raw
                );
                0
            }),
            None => 0,
        };

        Ok(Self {
            file_name: get("FILE_NAME").unwrap_or(defaults.file_name),
            overrides: UserOverrides {
                crf: parse_numeric(&get, "USER_CRF")?,
                preset: parse_numeric(&get, "USER_PRESET")?,
                res: parse_numeric(&get, "USER_RES")?,
                grain,
                audio_mode: get("AUDIO_MODE")
                    .map(|m| AudioMode::parse(&m))
                    .unwrap_or_default(),
                audio_bitrate: get("AUDIO_BITRATE").unwrap_or(defaults.overrides.audio_bitrate),
            },
            run_quality: get("RUN_VMAF")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }
}

fn parse_numeric<G>(get: &G, key: &str) -> Result<Option<u32>, AppError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim_end_matches('p')
                .parse::<u32>()
                .map_err(|_| AppError::Config(format!("{}={:?} is not a whole number", key, raw)))
        })
        .transpose()
}
