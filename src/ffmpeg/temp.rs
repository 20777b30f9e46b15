use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;

/// Run-scoped registry of produced files. Everything registered is removed when
/// the workspace is dropped, so success, failure and cancellation all clean up.
#[derive(Debug)]
pub struct RunWorkspace {
    dir: PathBuf,
    paths: Mutex<Vec<PathBuf>>,
}

impl RunWorkspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Path for `name` inside the workspace, registered for cleanup.
    pub fn file(&self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.register(path.clone());
        path
    }

    pub fn register(&self, path: PathBuf) {
        let mut guard = self.paths.lock();
        if !guard.contains(&path) {
            guard.push(path);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }

    pub fn cleanup(&self) {
        let mut guard = self.paths.lock();
        for path in guard.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!(
                    target: "orbit_encode::ffmpeg::temp",
                    "removed {}",
                    path.display()
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    target: "orbit_encode::ffmpeg::temp",
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}
