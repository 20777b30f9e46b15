//! Encode parameter selection: resolution tier defaults, user overrides,
//! filter ordering, audio policy and encoder tuning flags.

use serde::Serialize;

use crate::config::{AudioMode, PipelineConfig, UserOverrides};
use crate::crop::CropRect;
use crate::ffmpeg::MediaProfile;

const BASE_TUNE: &str = "tune=0:aq-mode=2:enable-overlays=1:scd=1:enable-tpl-la=1:tile-columns=1";

/// One video filter in the encode chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum VideoFilter {
    Crop(CropRect),
    /// Height-constrained scale, width derived to keep the aspect ratio.
    Scale { height: u32 },
}

impl VideoFilter {
    pub fn to_filter_string(&self) -> String {
        match self {
            VideoFilter::Crop(rect) => format!("crop={}", rect),
            VideoFilter::Scale { height } => format!("scale=-2:{}", height),
        }
    }
}

/// Immutable for the duration of one encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeSettings {
    pub crf: u32,
    pub preset: u32,
    /// Crop always precedes scale.
    pub video_filters: Vec<VideoFilter>,
    pub audio_mode: AudioMode,
    pub audio_bitrate: String,
    pub tune_flags: String,
}

impl EncodeSettings {
    pub fn filter_strings(&self) -> Vec<String> {
        self.video_filters
            .iter()
            .map(VideoFilter::to_filter_string)
            .collect()
    }

    /// Comma-joined `-vf` chain, `None` without filters.
    pub fn filter_chain(&self) -> Option<String> {
        if self.video_filters.is_empty() {
            None
        } else {
            Some(self.filter_strings().join(","))
        }
    }

    pub fn crop(&self) -> Option<&CropRect> {
        self.video_filters.iter().find_map(|f| match f {
            VideoFilter::Crop(rect) => Some(rect),
            VideoFilter::Scale { .. } => None,
        })
    }

    pub fn audio_label(&self) -> String {
        match self.audio_mode {
            AudioMode::Opus => format!("Opus {}", self.audio_bitrate),
            AudioMode::Passthrough => "Passthrough".to_string(),
            AudioMode::None => "None".to_string(),
        }
    }
}

/// SVT-AV1 parameter string: base knobs, then HDR, then grain synthesis.
pub fn tune_flags(is_hdr: bool, grain: u32) -> String {
    let mut flags = BASE_TUNE.to_string();
    if is_hdr {
        flags.push_str(":enable-hdr=1");
    }
    if grain > 0 {
        flags.push_str(&format!(":film-grain={}:film-grain-denoise=0", grain));
    }
    flags
}

/// Derive encode settings. Pure: the same inputs always give equal settings.
pub fn select_parameters(
    profile: &MediaProfile,
    crop: Option<&CropRect>,
    overrides: &UserOverrides,
    config: &PipelineConfig,
) -> EncodeSettings {
    let output_height = overrides.res.unwrap_or(profile.height);
    let tier = config.tier_for_height(output_height);

    let mut video_filters = Vec::with_capacity(2);
    if let Some(rect) = crop {
        video_filters.push(VideoFilter::Crop(*rect));
    }
    if let Some(height) = overrides.res {
        video_filters.push(VideoFilter::Scale { height });
    }

    let audio_mode = if profile.channel_count == 0 {
        AudioMode::None
    } else {
        overrides.audio_mode
    };
    let audio_bitrate = if audio_mode == AudioMode::Opus && profile.channel_count > 2 {
        config.multichannel_opus_bitrate.clone()
    } else {
        overrides.audio_bitrate.clone()
    };

    EncodeSettings {
        crf: overrides.crf.unwrap_or(tier.crf),
        preset: overrides.preset.unwrap_or(tier.preset),
        video_filters,
        audio_mode,
        audio_bitrate,
        tune_flags: tune_flags(profile.is_hdr, overrides.grain),
    }
}
