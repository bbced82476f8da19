use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use surveil_common::config::RecordingConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Container the clip is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipFormat {
    WebM,
    Mp4,
}

impl ClipFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ClipFormat::WebM => "webm",
            ClipFormat::Mp4 => "mp4",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ClipFormat::WebM => "video/webm",
            ClipFormat::Mp4 => "video/mp4",
        }
    }
}

/// ffmpeg encoder arguments for a configured codec name.
fn codec_args(config: &RecordingConfig) -> Result<(ClipFormat, Vec<String>), EncoderError> {
    let crf = config.crf.to_string();
    let args: Vec<&str> = match config.codec.as_str() {
        "vp8" => vec![
            "-c:v", "libvpx",
            "-crf", crf.as_str(),
            "-b:v", "1M",
            "-deadline", "realtime",
            "-cpu-used", "8",
        ],
        "vp9" => vec![
            "-c:v", "libvpx-vp9",
            "-crf", crf.as_str(),
            "-b:v", "0",
            "-deadline", "realtime",
            "-cpu-used", "8",
        ],
        "h264" | "h265" => {
            let vcodec = if config.codec == "h265" { "libx265" } else { "libx264" };
            vec![
                "-c:v", vcodec,
                "-preset", config.preset.as_str(),
                "-crf", crf.as_str(),
                "-pix_fmt", "yuv420p",
                "-movflags", "+faststart",
            ]
        }
        other => return Err(EncoderError::UnknownCodec(other.to_string())),
    };
    let format = match config.codec.as_str() {
        "vp8" | "vp9" => ClipFormat::WebM,
        _ => ClipFormat::Mp4,
    };
    Ok((format, args.into_iter().map(String::from).collect()))
}

static CLIP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Full ffmpeg argument list for one clip written to `output_path`.
///
/// Frames arrive at the camera's pace, so input timestamps come from the wall
/// clock and the output is resampled to `fps`. Playback length then tracks
/// the recorded duration.
fn command_args(config: &RecordingConfig, output_path: &Path) -> Result<(ClipFormat, Vec<String>), EncoderError> {
    let (format, encode_args) = codec_args(config)?;
    let mut args: Vec<String> = [
        "-loglevel", "error",
        "-use_wallclock_as_timestamps", "1",
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-i", "pipe:0",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.extend(encode_args);
    args.push("-r".into());
    args.push(config.fps.to_string());
    args.push("-y".into());
    args.push(output_path.display().to_string());
    Ok((format, args))
}

/// One recording in progress: an ffmpeg child fed JPEG frames on stdin.
pub struct ClipEncoder {
    child: Child,
    stdin: ChildStdin,
    output_path: PathBuf,
    format: ClipFormat,
    frame_count: u32,
    started_at: Instant,
    pub start_ms: i64,
}

pub struct FinishedClip {
    pub bytes: Vec<u8>,
    pub format: ClipFormat,
    pub duration_ms: u64,
    pub frame_count: u32,
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("unsupported codec {0:?}, expected vp8, vp9, h264 or h265")]
    UnknownCodec(String),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("failed to read ffmpeg output file: {0}")]
    ReadOutput(String),
}

impl ClipEncoder {
    /// Spawn ffmpeg ready to receive MJPEG frames on stdin. The clip is
    /// written to a temp file until [`ClipEncoder::finish`].
    pub async fn start(start_ms: i64, config: &RecordingConfig) -> Result<Self, EncoderError> {
        let (format, _) = codec_args(config)?;
        let output_path = std::env::temp_dir().join(format!(
            "surveil_clip_{start_ms}_{}_{}.{}",
            std::process::id(),
            CLIP_COUNTER.fetch_add(1, Ordering::Relaxed),
            format.extension()
        ));
        let (_, args) = command_args(config, &output_path)?;

        let mut cmd = Command::new(&config.ffmpeg);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| EncoderError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Spawn("could not get stdin handle".into()))?;

        debug!(
            codec = config.codec,
            crf = config.crf,
            fps = config.fps,
            output = output_path.display().to_string(),
            "ffmpeg clip encoder started"
        );

        Ok(Self {
            child,
            stdin,
            output_path,
            format,
            frame_count: 0,
            started_at: Instant::now(),
            start_ms,
        })
    }

    /// Write a single JPEG frame to ffmpeg's stdin pipe.
    pub async fn push_frame(&mut self, jpeg_data: &[u8]) -> Result<(), EncoderError> {
        self.stdin
            .write_all(jpeg_data)
            .await
            .map_err(|e| EncoderError::Write(e.to_string()))?;
        self.frame_count += 1;
        Ok(())
    }

    /// Close stdin, wait for ffmpeg and read back the clip. The temp file is
    /// removed in every case.
    pub async fn finish(self) -> Result<FinishedClip, EncoderError> {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let end_ms = self.start_ms + duration_ms as i64;

        // EOF on stdin ends the ffmpeg input.
        drop(self.stdin);

        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| EncoderError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            let _ = tokio::fs::remove_file(&self.output_path).await;
            return Err(EncoderError::FfmpegFailed(stderr.into_owned()));
        }

        let bytes = tokio::fs::read(&self.output_path)
            .await
            .map_err(|e| EncoderError::ReadOutput(e.to_string()))?;

        if let Err(e) = tokio::fs::remove_file(&self.output_path).await {
            warn!(path = self.output_path.display().to_string(), error = %e, "failed to delete temp clip file");
        }

        info!(
            frame_count = self.frame_count,
            bytes = bytes.len(),
            duration_ms,
            "clip encoding complete"
        );

        Ok(FinishedClip {
            bytes,
            format: self.format,
            duration_ms,
            frame_count: self.frame_count,
            start_ms: self.start_ms,
            end_ms,
        })
    }

    /// Kill ffmpeg and discard the partial clip.
    pub async fn abort(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill ffmpeg");
        }
        let _ = tokio::fs::remove_file(&self.output_path).await;
    }
}

/// Check whether ffmpeg is available. Logs a warning if not found.
pub async fn check_ffmpeg_available(ffmpeg: &str) {
    match Command::new(ffmpeg).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(ffmpeg, "ffmpeg is available");
        }
        Ok(_) => {
            warn!(ffmpeg, "ffmpeg returned non-zero for -version; recording may fail");
        }
        Err(e) => {
            warn!(
                ffmpeg,
                error = %e,
                "ffmpeg not found; recording will fail. \
                 Install ffmpeg with libvpx/libx264 support."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(codec: &str) -> RecordingConfig {
        RecordingConfig {
            codec: codec.into(),
            ..RecordingConfig::default()
        }
    }

    #[test]
    fn vp8_writes_webm() {
        let (format, args) = codec_args(&config("vp8")).unwrap();
        assert_eq!(format, ClipFormat::WebM);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx"]));
    }

    #[test]
    fn h265_writes_mp4() {
        let (format, args) = codec_args(&config("h265")).unwrap();
        assert_eq!(format, ClipFormat::Mp4);
        assert_eq!(format.mime(), "video/mp4");
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx265"]));
    }

    #[test]
    fn unknown_codec_rejected() {
        assert!(matches!(
            codec_args(&config("mpeg2")),
            Err(EncoderError::UnknownCodec(_))
        ));
    }

    #[test]
    fn input_uses_wall_clock_and_output_is_resampled() {
        let config = RecordingConfig {
            fps: 15.0,
            ..config("vp8")
        };
        let (_, args) = command_args(&config, Path::new("/tmp/clip.webm")).unwrap();
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        assert_eq!(args[pos("-use_wallclock_as_timestamps") + 1], "1");
        assert!(pos("-use_wallclock_as_timestamps") < pos("-i"));
        assert_eq!(args[pos("-r") + 1], "15");
        assert!(pos("-r") > pos("-i"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/clip.webm"));
    }

    #[tokio::test]
    async fn missing_ffmpeg_fails_to_start() {
        let config = RecordingConfig {
            ffmpeg: "/nonexistent/surveil-ffmpeg".into(),
            ..RecordingConfig::default()
        };
        assert!(matches!(
            ClipEncoder::start(0, &config).await,
            Err(EncoderError::Spawn(_))
        ));
    }
}
