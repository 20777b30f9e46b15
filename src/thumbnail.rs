//! 3x3 preview grid of the encoded output.

use std::path::{Path, PathBuf};

use crate::ffmpeg::{DiscardLines, Invocation, build_grid_args, run_tool};

/// Render the grid to `output`. Returns `None` (never an error) when the tool
/// fails or produces nothing; the grid is an optional extra.
pub async fn generate_grid(ffmpeg: &Path, input: &Path, output: &Path, duration: f64) -> Option<PathBuf> {
    if !(duration > 0.0) {
        return None;
    }
    let args = build_grid_args(input, output, duration);
    match run_tool(Invocation::new(ffmpeg, args), &mut DiscardLines).await {
        Ok(outcome) if outcome.success => {}
        Ok(outcome) => {
            log::warn!(
                target: "orbit_encode::thumbnail",
                "Grid generation exited with code {}",
                outcome.code()
            );
            return None;
        }
        Err(e) => {
            log::warn!(
                target: "orbit_encode::thumbnail",
                "Grid generation failed: {}",
                e
            );
            return None;
        }
    }
    match tokio::fs::metadata(output).await {
        Ok(m) if m.len() > 0 => Some(output.to_path_buf()),
        _ => {
            log::warn!(
                target: "orbit_encode::thumbnail",
                "Grid generation produced no image at {}",
                output.display()
            );
            None
        }
    }
}
