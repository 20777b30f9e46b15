pub mod config;
pub mod crop;
pub mod delivery;
pub mod encode;
pub mod error;
pub mod ffmpeg;
pub mod params;
pub mod pipeline;
pub mod quality;
pub mod status;
pub mod thumbnail;

pub use config::{AudioMode, JobRequest, PipelineConfig, UserOverrides};
pub use error::AppError;
pub use pipeline::{PipelineRun, RunPaths, RunSummary, Stage};
