mod builder;
pub mod discovery;
mod error;
pub mod ffprobe;
pub mod progress;
pub mod runner;
pub mod scores;
mod temp;

pub use builder::{
    build_cropdetect_args, build_encode_args, build_grid_args, build_quality_args,
    build_quality_filter, build_remux_args, format_args_for_display_multiline, format_timestamp,
};
pub use discovery::ToolPaths;
pub use error::{FfmpegErrorPayload, log_tail, parse_ffmpeg_error};
pub use ffprobe::{MediaProfile, inspect};
pub use progress::ProgressSample;
pub use runner::{
    CancelFlag, DiscardLines, Invocation, LineSink, RunLog, RunOutcome, StreamSource, run_tool,
};
pub use scores::{Score, ScoreScanner};
pub use temp::RunWorkspace;

/// Lossy path rendering for argument vectors.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
