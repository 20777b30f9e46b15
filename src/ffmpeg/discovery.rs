use crate::error::AppError;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Resolved external tool locations for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Optional: without it the remux step degrades to the raw encoder output.
    pub mkvmerge: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolve all tools. Env overrides (`FFMPEG_PATH`, `FFPROBE_PATH`, `MKVMERGE_PATH`)
    /// take precedence, then PATH, then common installation paths.
    pub fn discover() -> Result<Self, AppError> {
        let ffmpeg = resolve_tool("ffmpeg", "FFMPEG_PATH").ok_or_else(|| {
            log::error!(
                target: "orbit_encode::ffmpeg::discovery",
                "FFmpeg not found in PATH or common locations"
            );
            AppError::ToolNotFound(
                "FFmpeg not found. Install FFmpeg built with libsvtav1 and libvmaf, or set FFMPEG_PATH."
                    .to_string(),
            )
        })?;
        let ffprobe = match env_override("FFPROBE_PATH") {
            Some(p) => p,
            None => ffprobe_candidates(&ffmpeg)
                .into_iter()
                .find(|c| c.exists())
                .or_else(|| resolve_tool("ffprobe", "FFPROBE_PATH"))
                .ok_or_else(|| {
                    AppError::ToolNotFound(format!(
                        "ffprobe not found next to {} or in PATH",
                        ffmpeg.display()
                    ))
                })?,
        };
        let mkvmerge = resolve_tool("mkvmerge", "MKVMERGE_PATH");
        if mkvmerge.is_none() {
            log::warn!(
                target: "orbit_encode::ffmpeg::discovery",
                "mkvmerge not found; attachments and chapters will not be reattached"
            );
        }
        Ok(Self {
            ffmpeg,
            ffprobe,
            mkvmerge,
        })
    }
}

fn env_override(var: &str) -> Option<PathBuf> {
    let p = PathBuf::from(std::env::var(var).ok()?);
    if p.exists() {
        log::debug!(
            target: "orbit_encode::ffmpeg::discovery",
            "{} from env: {}",
            var,
            p.display()
        );
        Some(p)
    } else {
        None
    }
}

fn resolve_tool(name: &str, env_var: &str) -> Option<PathBuf> {
    if let Some(p) = env_override(env_var) {
        return Some(p);
    }
    if let Some(p) = find_in_path(name)
        && p.exists()
    {
        log::debug!(
            target: "orbit_encode::ffmpeg::discovery",
            "{} found in PATH: {}",
            name,
            p.display()
        );
        return Some(p);
    }
    common_paths(name).into_iter().find(|p| p.exists())
}

#[cfg(target_os = "windows")]
fn find_in_path(name: &str) -> Option<PathBuf> {
    first_line_path(Command::new("where").arg(name).output().ok()?)
}

#[cfg(not(target_os = "windows"))]
fn find_in_path(name: &str) -> Option<PathBuf> {
    first_line_path(Command::new("which").arg(name).output().ok()?)
}

fn first_line_path(output: std::process::Output) -> Option<PathBuf> {
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout);
    let first = path.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(PathBuf::from(first))
    }
}

fn common_paths(name: &str) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        ["/opt/homebrew/bin", "/usr/local/bin", "/opt/local/bin"]
            .iter()
            .map(|dir| Path::new(dir).join(name))
            .collect()
    }

    #[cfg(target_os = "windows")]
    {
        [r"C:\ffmpeg\bin", r"C:\Program Files\ffmpeg\bin"]
            .iter()
            .map(|dir| Path::new(dir).join(format!("{name}.exe")))
            .collect()
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        ["/usr/bin", "/usr/local/bin"]
            .iter()
            .map(|dir| Path::new(dir).join(name))
            .collect()
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        let _ = name;
        vec![]
    }
}

/// Paths to try for ffprobe given an ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let parent = match ffmpeg_path.parent() {
        Some(p) => p,
        None => return vec![],
    };
    let mut candidates = Vec::with_capacity(2);
    let stem = ffmpeg_path.file_stem().and_then(|s| s.to_str());
    if let Some(suffix) = stem.and_then(|s| s.strip_prefix("ffmpeg"))
        && !suffix.is_empty()
    {
        #[cfg(target_os = "windows")]
        candidates.push(parent.join(format!("ffprobe{suffix}.exe")));
        #[cfg(not(target_os = "windows"))]
        candidates.push(parent.join(format!("ffprobe{suffix}")));
    }
    #[cfg(target_os = "windows")]
    candidates.push(parent.join("ffprobe.exe"));
    #[cfg(not(target_os = "windows"))]
    candidates.push(parent.join("ffprobe"));
    candidates
}
