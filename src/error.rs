//! Run-level error type. Display is for logs and status text; Serialize is
//! the `job.error` payload.

use crate::ffmpeg::parse_ffmpeg_error;
use crate::status::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ToolNotFound(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("FFmpeg failed (code {code}): {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    #[error("Aborted")]
    Aborted,

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Status channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AppError {
    pub fn aborted() -> Self {
        Self::Aborted
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe(message.into())
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    pub fn ffmpeg_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::FfmpegFailed {
            code,
            stderr: stderr.into(),
        }
    }

    /// True when the run stopped because the cancel flag was raised.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl AppError {
    /// Stable machine-readable category for the event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::ToolNotFound(_) => "toolNotFound",
            Self::Probe(_) => "probe",
            Self::FfmpegFailed { .. } => "encode",
            Self::Aborted => "cancelled",
            Self::Delivery(_) => "delivery",
            Self::Channel(_) => "channel",
            Self::Config(_) => "config",
        }
    }
}

/// `{ kind, summary, detail }`. Tool failures carry a diagnosis and the raw stderr.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let (summary, detail) = match self {
            AppError::FfmpegFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                (payload.summary, payload.detail)
            }
            other => (other.to_string(), String::new()),
        };
        let mut state = serializer.serialize_struct("AppError", 3)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("summary", &summary)?;
        state.serialize_field("detail", &detail)?;
        state.end()
    }
}
