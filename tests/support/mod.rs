#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use orbit_encode_core::delivery::TransferEndpoint;
use orbit_encode_core::ffmpeg::{CancelFlag, ToolPaths};
use orbit_encode_core::status::{ChannelError, MessageHandle, StatusChannel};
use orbit_encode_core::{AppError, JobRequest, PipelineConfig, PipelineRun, RunPaths};

pub const PROBE_1080P_STEREO: &str = r#"{
    "format": { "duration": "120.000000" },
    "streams": [
        { "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
          "r_frame_rate": "24/1", "nb_frames": "2880", "color_primaries": "bt709" },
        { "codec_type": "audio", "codec_name": "aac", "channels": 2 }
    ]
}"#;

pub const PROBE_SILENT_720P: &str = r#"{
    "format": { "duration": "60.0" },
    "streams": [
        { "codec_type": "video", "width": 1280, "height": 720, "r_frame_rate": "30/1" }
    ]
}"#;

pub const NO_CROP: &str = "crop=1920:1080:0:0";

/// How the fake tools behave for one test.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub probe_json: String,
    pub crop_line: String,
    /// Leading encode attempts that exit 1.
    pub encode_failures: u32,
    pub output_bytes: u64,
    pub quality_crashes: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            probe_json: PROBE_1080P_STEREO.to_string(),
            crop_line: NO_CROP.to_string(),
            encode_failures: 0,
            output_bytes: 4096,
            quality_crashes: false,
        }
    }
}

/// Scripted ffmpeg/ffprobe/mkvmerge in a temp dir, plus a work dir with a source file.
pub struct FakeToolkit {
    _root: TempDir,
    pub bin_dir: PathBuf,
    pub work_dir: PathBuf,
    pub source: PathBuf,
    /// Every invocation's arguments, one line each, prefixed with the tool name.
    pub args_log: PathBuf,
    pub tools: ToolPaths,
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write fake tool");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
}

impl FakeToolkit {
    pub fn install(behavior: &FakeBehavior) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let bin_dir = root.path().join("bin");
        let work_dir = root.path().join("work");
        fs::create_dir_all(&bin_dir).unwrap();
        fs::create_dir_all(&work_dir).unwrap();

        let args_log = root.path().join("args.log");
        let counter = root.path().join("encode_attempts");
        let probe_json = root.path().join("probe.json");
        fs::write(&probe_json, &behavior.probe_json).unwrap();

        let ffprobe = bin_dir.join("ffprobe");
        write_script(
            &ffprobe,
            &format!(
                "#!/bin/sh\necho \"ffprobe $*\" >> \"{log}\"\ncat \"{json}\"\n",
                log = args_log.display(),
                json = probe_json.display()
            ),
        );

        let ffmpeg = bin_dir.join("ffmpeg");
        write_script(
            &ffmpeg,
            &format!(
                r#"#!/bin/sh
echo "ffmpeg $*" >> "{log}"
for last; do :; done
case "$*" in
  *cropdetect*)
    echo "[Parsed_cropdetect_0 @ 0x1] x1:0 {crop}" >&2
    echo "[Parsed_cropdetect_0 @ 0x1] x1:0 {crop}" >&2
    exit 0
    ;;
  *libvmaf*)
    echo "frame=10"
    echo "progress=continue"
    if [ "{quality_crash}" = "1" ]; then
      echo "Segmentation fault" >&2
      exit 139
    fi
    echo "frame=720"
    echo "progress=end"
    echo "[Parsed_libvmaf_6 @ 0x2] VMAF score: 95.500000" >&2
    echo "[Parsed_ssim_7 @ 0x3] SSIM Y:0.990 (20.0) U:0.99 (21.2) V:0.99 (21.0) All:0.987000 (19.08)" >&2
    exit 0
    ;;
  *tile=3x3*)
    printf 'JPEG' > "$last"
    exit 0
    ;;
  *libsvtav1*)
    n=$(cat "{counter}" 2>/dev/null || echo 0)
    n=$((n+1))
    echo "$n" > "{counter}"
    echo "Svt[info]: encoder attempt $n" >&2
    echo "out_time_us=1000000"
    if [ "$n" -le {failures} ]; then
      echo "Error while encoding on attempt $n" >&2
      exit 1
    fi
    head -c {bytes} /dev/zero > "$last"
    echo "out_time_us=120000000"
    echo "progress=end"
    echo "encode finished on attempt $n" >&2
    exit 0
    ;;
esac
echo "unexpected invocation: $*" >&2
exit 2
"#,
                log = args_log.display(),
                crop = behavior.crop_line,
                quality_crash = if behavior.quality_crashes { "1" } else { "0" },
                counter = counter.display(),
                failures = behavior.encode_failures,
                bytes = behavior.output_bytes,
            ),
        );

        let mkvmerge = bin_dir.join("mkvmerge");
        write_script(
            &mkvmerge,
            &format!(
                "#!/bin/sh\necho \"mkvmerge $*\" >> \"{log}\"\ncp \"$3\" \"$2\"\n",
                log = args_log.display()
            ),
        );

        let source = work_dir.join("source.mkv");
        fs::write(&source, b"source bytes").unwrap();

        Self {
            tools: ToolPaths {
                ffmpeg,
                ffprobe,
                mkvmerge: Some(mkvmerge),
            },
            _root: root,
            bin_dir,
            work_dir,
            source,
            args_log,
        }
    }

    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.args_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn invocations_matching(&self, needle: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|l| l.contains(needle))
            .collect()
    }

    pub fn work_dir_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.work_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn pipeline(
        &self,
        request: JobRequest,
        config: PipelineConfig,
        channel: Arc<RecordingChannel>,
        endpoint: Arc<RecordingTransfer>,
    ) -> PipelineRun {
        PipelineRun::new(
            request,
            config,
            self.tools.clone(),
            RunPaths::in_dir(&self.work_dir, &self.source),
            channel,
            endpoint,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Send(String),
    Edit(u64, String),
    File {
        name: String,
        caption: Option<String>,
        existed: bool,
    },
}

/// Status channel that records every write.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<ChannelEvent>>,
    text_times: Mutex<Vec<(Instant, String)>>,
    next_id: AtomicU64,
    trip: Mutex<Option<(String, CancelFlag)>>,
    refuse_file: Mutex<Option<String>>,
}

impl RecordingChannel {
    /// Raise `flag` the first time a status text contains `needle`.
    pub fn cancel_on_text(&self, needle: &str, flag: CancelFlag) {
        *self.trip.lock() = Some((needle.to_string(), flag));
    }

    /// Reject every `send_file` of a file with this name.
    pub fn refuse_file(&self, name: &str) {
        *self.refuse_file.lock() = Some(name.to_string());
    }

    fn record_text(&self, event: ChannelEvent, text: &str) {
        if let Some((needle, flag)) = self.trip.lock().as_ref()
            && text.contains(needle.as_str())
        {
            flag.cancel();
        }
        self.text_times.lock().push((Instant::now(), text.to_string()));
        self.events.lock().push(event);
    }

    /// Every text write with the moment it arrived.
    pub fn timed_texts(&self) -> Vec<(Instant, String)> {
        self.text_times.lock().clone()
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn files(&self) -> Vec<(String, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::File { name, caption, .. } => Some((name, caption)),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Send(t) | ChannelEvent::Edit(_, t) => Some(t),
                ChannelEvent::File { .. } => None,
            })
            .collect()
    }

    pub fn last_text(&self) -> Option<String> {
        self.texts().pop()
    }
}

#[async_trait]
impl StatusChannel for RecordingChannel {
    async fn send_message(&self, text: &str) -> Result<MessageHandle, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.record_text(ChannelEvent::Send(text.to_string()), text);
        Ok(MessageHandle(id))
    }

    async fn edit_message(&self, handle: MessageHandle, text: &str) -> Result<(), ChannelError> {
        self.record_text(ChannelEvent::Edit(handle.0, text.to_string()), text);
        Ok(())
    }

    async fn send_file(&self, path: &Path, caption: Option<&str>) -> Result<(), ChannelError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.refuse_file.lock().as_deref() == Some(name.as_str()) {
            return Err(ChannelError::Failed("file too large".to_string()));
        }
        self.events.lock().push(ChannelEvent::File {
            name,
            caption: caption.map(str::to_string),
            existed: path.exists(),
        });
        Ok(())
    }
}

/// Transfer endpoint that records uploads and hands out a fixed link.
#[derive(Default)]
pub struct RecordingTransfer {
    uploads: Mutex<Vec<(PathBuf, u64)>>,
    unreachable: bool,
}

pub const TRANSFER_LINK: &str = "https://transfer.test/abc123";

impl RecordingTransfer {
    /// Endpoint whose every upload fails.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<(PathBuf, u64)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl TransferEndpoint for RecordingTransfer {
    async fn upload(&self, path: &Path) -> Result<String, AppError> {
        let size = fs::metadata(path)?.len();
        self.uploads.lock().push((path.to_path_buf(), size));
        if self.unreachable {
            return Err(AppError::delivery("transfer endpoint returned 503"));
        }
        Ok(TRANSFER_LINK.to_string())
    }
}
