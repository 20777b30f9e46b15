//! Output routing: reattach ancillary streams, measure, then pick direct
//! delivery or the overflow transfer endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AppError;
use crate::ffmpeg::{DiscardLines, Invocation, build_remux_args, run_tool};
use crate::status::{StatusReporter, TEXT_OVERFLOW, format_mib};

const DEFAULT_TRANSFER_URL: &str = "https://file.io";
const DEFAULT_TRANSFER_EXPIRES: &str = "3d";
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "route")]
pub enum Delivery {
    Direct { size_bytes: u64 },
    Overflow { transfer_url: String, size_bytes: u64 },
}

/// External store used for artifacts too large to deliver directly.
#[async_trait]
pub trait TransferEndpoint: Send + Sync {
    /// Upload and return a time-limited download link.
    async fn upload(&self, path: &Path) -> Result<String, AppError>;
}

/// Multipart HTTP upload (file.io-compatible).
pub struct HttpTransfer {
    http: reqwest::Client,
    url: String,
    expires: Option<String>,
}

impl HttpTransfer {
    pub fn new(url: impl Into<String>, expires: Option<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| AppError::delivery(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
            expires,
        })
    }

    /// `TRANSFER_URL` and `TRANSFER_EXPIRES`, with file.io and 3 days as defaults.
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("TRANSFER_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TRANSFER_URL.to_string());
        let expires = match std::env::var("TRANSFER_EXPIRES") {
            Ok(s) if s.trim().is_empty() => None,
            Ok(s) => Some(s),
            Err(_) => Some(DEFAULT_TRANSFER_EXPIRES.to_string()),
        };
        Self::new(url, expires)
    }
}

/// Link from a JSON `link`/`url` field, or a plain-text body that is itself a URL.
pub fn parse_transfer_response(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        return ["link", "url"]
            .iter()
            .find_map(|k| value.get(k).and_then(|v| v.as_str()))
            .map(str::to_string);
    }
    let trimmed = body.trim();
    (trimmed.starts_with("http://") || trimmed.starts_with("https://")).then(|| trimmed.to_string())
}

#[async_trait]
impl TransferEndpoint for HttpTransfer {
    async fn upload(&self, path: &Path) -> Result<String, AppError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "output.mkv".to_string());
        log::info!(
            target: "orbit_encode::delivery",
            "Uploading {} ({}) to {}",
            name,
            format_mib(len),
            self.url
        );

        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::from(file), len)
            .file_name(name);
        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(expires) = &self.expires {
            form = form.text("expires", expires.clone());
        }

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::delivery(format!("upload request: {}", e)))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::delivery(format!(
                "transfer endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        parse_transfer_response(&body)
            .ok_or_else(|| AppError::delivery("transfer endpoint returned no link"))
    }
}

/// Copy chapters, attachments and fonts from the source into the encode.
/// On any failure the encoder output is kept as-is. Returns whether it was replaced.
pub async fn reattach_ancillary(
    mkvmerge: Option<&Path>,
    encoded: &Path,
    source: &Path,
    fixed: &Path,
) -> bool {
    let Some(mkvmerge) = mkvmerge else {
        log::warn!(
            target: "orbit_encode::delivery",
            "mkvmerge unavailable; keeping encoder output"
        );
        return false;
    };
    let args = build_remux_args(encoded, source, fixed);
    let outcome = run_tool(Invocation::new(mkvmerge, args), &mut DiscardLines).await;
    // mkvmerge exits 1 for warnings with a usable file
    let usable = match &outcome {
        Ok(o) => matches!(o.exit_code, Some(0) | Some(1)),
        Err(_) => false,
    };
    let produced = tokio::fs::metadata(fixed)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !(usable && produced) {
        log::warn!(
            target: "orbit_encode::delivery",
            "Remux failed ({}); keeping encoder output",
            match outcome {
                Ok(o) => format!("exit code {}", o.code()),
                Err(e) => e.to_string(),
            }
        );
        let _ = tokio::fs::remove_file(fixed).await;
        return false;
    }
    match tokio::fs::rename(fixed, encoded).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!(
                target: "orbit_encode::delivery",
                "Could not replace {} with remuxed file: {}",
                encoded.display(),
                e
            );
            let _ = tokio::fs::remove_file(fixed).await;
            false
        }
    }
}

pub fn exceeds_ceiling(size_bytes: u64, ceiling_bytes: u64) -> bool {
    size_bytes >= ceiling_bytes
}

/// Measure the artifact and pick its route. Overflow uploads through `endpoint`.
pub async fn route_output(
    artifact: &Path,
    ceiling_bytes: u64,
    endpoint: &dyn TransferEndpoint,
    reporter: Option<&mut StatusReporter>,
) -> Result<Delivery, AppError> {
    let size_bytes = tokio::fs::metadata(artifact)
        .await
        .map_err(|e| AppError::delivery(format!("{}: {}", artifact.display(), e)))?
        .len();
    if !exceeds_ceiling(size_bytes, ceiling_bytes) {
        log::info!(
            target: "orbit_encode::delivery",
            "Direct delivery: {}",
            format_mib(size_bytes)
        );
        return Ok(Delivery::Direct { size_bytes });
    }

    log::info!(
        target: "orbit_encode::delivery",
        "Overflow: {} >= {}",
        format_mib(size_bytes),
        format_mib(ceiling_bytes)
    );
    if let Some(reporter) = reporter {
        reporter.update(TEXT_OVERFLOW).await;
    }
    let transfer_url = endpoint.upload(artifact).await?;
    Ok(Delivery::Overflow {
        transfer_url,
        size_bytes,
    })
}

/// Output path for the remuxed file next to the encode.
pub fn fixed_path(encoded: &Path) -> PathBuf {
    let name = encoded
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    encoded.with_file_name(format!("FIXED_{}", name))
}
